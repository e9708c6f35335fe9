use std::{
    collections::{BTreeMap, HashMap},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crossbar_protocol::filename::{self, DEFAULT_INTERVAL};
use crossbar_shared_util::PluginId;

use super::HostConfig;
use crate::error::LoadError;

/// Static metadata of a plugin. Created once when the plugin directory is loaded, and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// The file name of the plugin, i.e. `weather.30m.py`.
    pub id: PluginId,
    /// The name part of the file name, i.e. `weather`.
    pub name: String,
    pub interval: Duration,
    pub path: PathBuf,
    /// The directory containing the plugin. Plugins are always run from here.
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Environment variables added on top of the environment of the host.
    pub env: BTreeMap<String, String>,
}

/// How deep into subdirectories of the plugin directory plugins are searched for.
const MAX_SCAN_DEPTH: usize = 1;

/// Load all plugins in the given directory, in a stable order.
///
/// Only an unreadable plugin directory is an error. Problems with individual files are logged and the file is
/// either skipped (not executable) or loaded with a fallback interval (malformed file name).
pub fn load_plugins(directory: &Path, config: &HostConfig) -> Result<Vec<Arc<PluginDescriptor>>, LoadError> {
    match std::fs::metadata(directory) {
        Ok(meta) if !meta.is_dir() => return Err(LoadError::NotADirectory(directory.to_path_buf())),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(LoadError::Missing(directory.to_path_buf())),
        Err(source) => return Err(LoadError::Unreadable { path: directory.to_path_buf(), source }),
    }

    let mut candidates = Vec::new();
    collect_candidates(directory, 0, &mut candidates)
        .map_err(|source| LoadError::Unreadable { path: directory.to_path_buf(), source })?;

    let mut plugins: Vec<Arc<PluginDescriptor>> = Vec::new();
    let mut positions: HashMap<(String, Duration), usize> = HashMap::new();
    for path in candidates {
        let Some(descriptor) = descriptor_for(&path, config) else { continue };
        let key = (descriptor.name.clone(), descriptor.interval);
        match positions.get(&key) {
            Some(&idx) => {
                log::warn!(
                    "Plugins {} and {} both resolve to `{}` running every {}. Using {}",
                    plugins[idx].path.display(),
                    descriptor.path.display(),
                    descriptor.name,
                    filename::format_interval(descriptor.interval),
                    descriptor.path.display(),
                );
                plugins[idx] = Arc::new(descriptor);
            }
            None => {
                positions.insert(key, plugins.len());
                plugins.push(Arc::new(descriptor));
            }
        }
    }

    log::info!("Loaded {} plugins from {}", plugins.len(), directory.display());
    Ok(plugins)
}

/// Collect all non-hidden files in `dir` and its subdirectories (up to [`MAX_SCAN_DEPTH`]), sorted by path.
fn collect_candidates(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.map(|entry| entry.map(|e| e.path())).collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        let hidden = path.file_name().and_then(|name| name.to_str()).map_or(true, |name| name.starts_with('.'));
        if hidden {
            continue;
        }
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() && depth < MAX_SCAN_DEPTH => {
                if let Err(err) = collect_candidates(&path, depth + 1, out) {
                    log::warn!("Skipping plugin subdirectory {}: {}", path.display(), err);
                }
            }
            Ok(meta) if meta.is_file() => out.push(path),
            Ok(_) => {}
            Err(err) => log::warn!("Skipping {}: {}", path.display(), err),
        }
    }
    Ok(())
}

fn descriptor_for(path: &Path, config: &HostConfig) -> Option<PluginDescriptor> {
    let file_name = path.file_name()?.to_str()?;

    match std::fs::metadata(path) {
        Ok(meta) if meta.permissions().mode() & 0o111 == 0 => {
            log::warn!("Skipping plugin {}: file is not executable", path.display());
            return None;
        }
        Ok(_) => {}
        Err(err) => {
            log::warn!("Skipping plugin {}: {}", path.display(), err);
            return None;
        }
    }

    let parsed = filename::parse_file_name(file_name);
    if let Err(err) = &parsed.interval {
        log::warn!(
            "Could not read the refresh interval of plugin {} ({}). Running it every {}",
            path.display(),
            err,
            filename::format_interval(DEFAULT_INTERVAL)
        );
    }

    if config.plugin_config(file_name, &parsed.name).is_some_and(|cfg| !cfg.enabled) {
        log::info!("Plugin {} is disabled in the configuration", file_name);
        return None;
    }

    Some(PluginDescriptor {
        id: PluginId::from(file_name),
        interval: parsed.interval_or_default(),
        path: path.to_path_buf(),
        working_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        timeout: config.timeout_for(file_name, &parsed.name),
        env: config.environment_for(file_name, &parsed.name),
        name: parsed.name,
    })
}
