use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};

/// Stores references to all the paths relevant to crossbar-host, and abstracts access to these files and directories
#[derive(Debug, Clone)]
pub struct CrossbarPaths {
    pub log_file: PathBuf,
    pub ipc_socket_file: PathBuf,
    pub config_dir: PathBuf,
}

impl CrossbarPaths {
    pub fn from_config_dir<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref();
        if config_dir.is_file() {
            bail!("Please provide the path to the config directory, not a file within it")
        }

        if !config_dir.exists() {
            bail!("Configuration directory {} does not exist", config_dir.display());
        }

        let config_dir = config_dir.canonicalize()?;

        let mut hasher = DefaultHasher::new();
        format!("{}", config_dir.display()).hash(&mut hasher);
        // daemon_id is a hash of the config dir path, which keeps the socket path short enough for sun_path (man 7 unix)
        let daemon_id = format!("{:x}", hasher.finish());

        let ipc_socket_file = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join(format!("crossbar-host_{}", daemon_id));

        // 100 as the limit isn't quite 108 everywhere (i.e 104 on BSD or mac)
        if format!("{}", ipc_socket_file.display()).len() > 100 {
            log::warn!("The IPC socket file's absolute path exceeds 100 bytes, the socket may fail to create.");
        }

        let log_dir = match std::env::var("XDG_CACHE_HOME") {
            Ok(cache_home) => PathBuf::from(cache_home),
            Err(_) => home_dir()?.join(".cache"),
        }
        .join("crossbar");

        if !log_dir.exists() {
            log::info!("Creating log dir");
            std::fs::create_dir_all(&log_dir)?;
        }

        Ok(CrossbarPaths { config_dir, log_file: log_dir.join(format!("crossbar-host_{}.log", daemon_id)), ipc_socket_file })
    }

    pub fn default() -> Result<Self> {
        let config_dir = match std::env::var("XDG_CONFIG_HOME") {
            Ok(config_home) => PathBuf::from(config_home),
            Err(_) => home_dir()?.join(".config"),
        }
        .join("crossbar");

        Self::from_config_dir(config_dir)
    }

    pub fn get_log_file(&self) -> &Path {
        self.log_file.as_path()
    }

    pub fn get_ipc_socket_file(&self) -> &Path {
        self.ipc_socket_file.as_path()
    }

    pub fn get_config_dir(&self) -> &Path {
        self.config_dir.as_path()
    }

    pub fn get_config_file(&self) -> PathBuf {
        self.config_dir.join("crossbar.json")
    }

    /// Resolve the plugin directory configured in crossbar.json. Relative paths are relative to the config dir.
    pub fn get_plugin_dir(&self, configured: &Path) -> PathBuf {
        self.config_dir.join(configured)
    }
}

fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME").map(PathBuf::from).context("Neither the XDG base directory nor $HOME are set")
}

impl std::fmt::Display for CrossbarPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "config-dir: {}, ipc-socket: {}, log-file: {}",
            self.config_dir.display(),
            self.ipc_socket_file.display(),
            self.log_file.display()
        )
    }
}
