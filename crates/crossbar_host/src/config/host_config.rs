use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::error::ConfigError;

/// Host configuration, read from `crossbar.json` in the config directory.
///
/// This is the only place plugin settings come from: the loader turns it into the environment of each plugin,
/// and nothing else in the host looks at ambient configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Directory the plugins are loaded from, relative to the config directory.
    #[default(PathBuf::from("plugins"))]
    pub plugin_dir: PathBuf,

    #[default(Duration::from_secs(10))]
    #[serde(with = "duration_str")]
    pub default_timeout: Duration,

    /// Upper bound for the captured stdout and stderr of a single run, each.
    #[default(64 * 1024)]
    pub max_output_bytes: usize,

    /// Run every plugin once right away instead of waiting one interval for the first tick.
    pub run_on_start: bool,

    pub partial_output: PartialOutputPolicy,

    pub bar: BarConfig,

    /// Color given to the title of a plugin whose last run failed.
    #[default("red".to_string())]
    pub failure_color: String,

    /// What the daemon prints to stdout whenever the display changes.
    pub output: OutputFormat,

    /// If set, a JSON snapshot for home-screen style widgets is written to this file on every change.
    pub widget_export: Option<PathBuf>,

    /// Command prefix used to run `bash` actions that ask for a terminal.
    #[default(vec!["x-terminal-emulator".to_string(), "-e".to_string()])]
    pub terminal: Vec<String>,

    /// The external `crossbar` helper queried by `crossbar-host stat`. `null` disables it.
    #[default(Some("crossbar".to_string()))]
    pub crossbar_binary: Option<String>,

    /// Environment variables given to every plugin.
    pub env: BTreeMap<String, String>,

    /// Per-plugin settings, keyed by plugin identifier (`weather.30m.py`) or name (`weather`).
    pub plugins: BTreeMap<String, PluginConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    #[default(true)]
    pub enabled: bool,

    #[serde(with = "duration_str::option")]
    pub timeout: Option<Duration>,

    /// Variables passed to the plugin verbatim, i.e. `GITHUB_TOKEN`.
    pub env: BTreeMap<String, String>,

    /// Settings passed as `CROSSBAR_PLUGIN_<KEY>`, i.e. `currency` becomes `CROSSBAR_PLUGIN_CURRENCY`.
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default, deny_unknown_fields)]
pub struct BarConfig {
    pub mode: BarMode,
    #[default("  ".to_string())]
    pub separator: String,
}

/// Which titles make up the collapsed status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(rename_all = "lowercase")]
pub enum BarMode {
    #[default]
    All,
    /// Only show the title of the plugin with the given identifier.
    Primary(String),
}

/// What to do with stdout of a run that exited unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SmartDefault, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartialOutputPolicy {
    /// Ignore it and keep showing the last good result.
    #[default]
    Discard,
    /// Show it if it parses, while still recording the failure. Output of timed out runs is always discarded.
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SmartDefault, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    None,
    Text,
    Json,
}

impl HostConfig {
    /// Read the configuration file. A missing file results in the default configuration.
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No configuration file at {}, using defaults", path.display());
                return Ok(HostConfig::default());
            }
            Err(source) => return Err(ConfigError::Read { path: path.to_path_buf(), source }),
        };
        serde_json::from_str(&content).map_err(|source| ConfigError::Invalid { path: path.to_path_buf(), source })
    }

    /// Find the settings for a plugin. An entry for the full identifier takes precedence over one for the name.
    pub fn plugin_config(&self, identifier: &str, name: &str) -> Option<&PluginConfig> {
        self.plugins.get(identifier).or_else(|| self.plugins.get(name))
    }

    pub fn timeout_for(&self, identifier: &str, name: &str) -> Duration {
        self.plugin_config(identifier, name).and_then(|cfg| cfg.timeout).unwrap_or(self.default_timeout)
    }

    /// The environment overrides for a plugin: global `env`, then the plugin's `settings`, then its `env`.
    /// Later sources win. Nothing is added for settings that aren't configured.
    pub fn environment_for(&self, identifier: &str, name: &str) -> BTreeMap<String, String> {
        let mut environment = self.env.clone();
        if let Some(plugin) = self.plugin_config(identifier, name) {
            for (key, value) in &plugin.settings {
                environment.insert(setting_env_var(key), value.clone());
            }
            environment.extend(plugin.env.clone());
        }
        environment
    }
}

/// `currency` → `CROSSBAR_PLUGIN_CURRENCY`, `api-key` → `CROSSBAR_PLUGIN_API_KEY`
pub fn setting_env_var(key: &str) -> String {
    let key: String = key.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }).collect();
    format!("CROSSBAR_PLUGIN_{}", key)
}

/// (De)serialize durations as strings like `10s` or `500ms`.
mod duration_str {
    use std::time::Duration;

    use crossbar_protocol::filename::{format_interval, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_interval(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?.map(|s| parse_duration(&s).map_err(serde::de::Error::custom)).transpose()
        }
    }
}
