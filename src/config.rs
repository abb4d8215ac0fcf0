use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub connections: ConnectionsConfig,
    pub filters: FiltersConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub refresh_interval_ms: u64,
    pub default_view: String,
    pub default_filter: String,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            refresh_interval_ms: 5000,
            default_view: "tree".to_string(),
            default_filter: "all".to_string(),
            log_level: "warn".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Count sockets for every process on each refresh.
    pub count_on_refresh: bool,
    /// Concurrent descriptor-table walks per logical core.
    pub workers_per_core: usize,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        ConnectionsConfig {
            count_on_refresh: true,
            workers_per_core: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    pub application_path_marker: String,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        FiltersConfig {
            application_path_marker: "/Applications/".to_string(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("proctree").join("config.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub fn load_config() -> Config {
    try_load_config().unwrap_or_else(fallback)
}

pub fn load_config_from_path(path: &Path) -> Config {
    try_load_config_from_path(path).unwrap_or_else(fallback)
}

/// Like [`load_config`], but hands back the problem instead of logging it, for
/// callers that load config before a subscriber is installed.
pub fn try_load_config() -> Result<Config, ConfigError> {
    match config_path() {
        Some(path) => try_load_config_from_path(&path),
        None => Ok(Config::default()),
    }
}

/// A missing file is not an error; it means defaults.
pub fn try_load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn fallback(err: ConfigError) -> Config {
    tracing::warn!(error = %err, "using default config");
    Config::default()
}
