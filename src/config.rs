//! Daemon configuration, read from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_ENV: &str = "SHAREINDEX_CONFIG";
const CONFIG_FILE: &str = "shareindex/config.json";
const DB_FILE: &str = "shareindex/shares.db";

/// Separator peers expect inside masked paths.
pub const DEFAULT_SEPARATOR: char = '\\';

/// What the scanner does when a share root cannot be enumerated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanFailurePolicy {
    /// Leave the root out of the snapshot and record a warning.
    #[default]
    Skip,
    /// Fail the whole scan.
    Abort,
}

/// A configured share root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareConfig {
    pub path: PathBuf,

    /// Name peers see in place of the local root. Defaults to the root's final component.
    #[serde(default)]
    pub alias: Option<String>,

    /// Withhold this subtree from every other share.
    #[serde(default)]
    pub exclude: bool,
}

impl ShareConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alias: None,
            exclude: false,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn excluded(path: impl Into<PathBuf>) -> Self {
        Self {
            exclude: true,
            ..Self::new(path)
        }
    }

    /// The alias this root is published under.
    pub fn remote_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shares: Vec<ShareConfig>,

    /// Maximum age of the in-memory index, in milliseconds.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,

    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default = "default_separator")]
    pub separator: char,

    /// Regexes matched against local file paths; matching files are not shared.
    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub on_root_failure: ScanFailurePolicy,
}

fn default_cache_ttl_ms() -> u64 {
    3_600_000
}

fn default_rescan_interval_secs() -> u64 {
    3600
}

fn default_database() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DB_FILE)
}

fn default_separator() -> char {
    DEFAULT_SEPARATOR
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shares: Vec::new(),
            cache_ttl_ms: default_cache_ttl_ms(),
            rescan_interval_secs: default_rescan_interval_secs(),
            database: default_database(),
            separator: default_separator(),
            filters: Vec::new(),
            on_root_failure: ScanFailurePolicy::default(),
        }
    }
}

impl Config {
    /// Where the config file lives: `$SHAREINDEX_CONFIG`, else the user config directory.
    pub fn locate() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::config(path, format!("unable to read: {e}")))?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|e| Error::config(path, e.to_string()))?;
        config.compile_filters().map_err(|e| Error::config(path, e.to_string()))?;
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn compile_filters(&self) -> std::result::Result<Vec<Regex>, regex::Error> {
        self.filters.iter().map(|f| Regex::new(f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config =
            serde_json::from_str(r#"{"shares": [{"path": "/srv/music"}]}"#).unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.separator, '\\');
        assert_eq!(config.on_root_failure, ScanFailurePolicy::Skip);
        assert_eq!(config.shares[0].remote_name(), "music");
    }

    #[test]
    fn test_alias_and_policy() {
        let config: Config = serde_json::from_str(
            r#"{
                "shares": [{"path": "/srv/music", "alias": "Tunes"}, {"path": "/srv/music/private", "exclude": true}],
                "on_root_failure": "abort",
                "separator": "/"
            }"#,
        )
        .unwrap();
        assert_eq!(config.shares[0].remote_name(), "Tunes");
        assert!(config.shares[1].exclude);
        assert_eq!(config.on_root_failure, ScanFailurePolicy::Abort);
        assert_eq!(config.separator, '/');
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"filters": ["(unclosed"]}"#).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
