//! Application configuration loaded from the environment.
//!
//! Supported env vars:
//! - `DATABASE_URL` (default `sqlite:dadaloader.db?mode=rwc`)
//! - `DADALOADER_LOG_DIR` (default `logs`)
//! - `DADALOADER_ARIA2C` (default `aria2c` on `PATH`)
//! - `DADALOADER_DOWNLOAD_DIR` (default `~/Downloads/dadaloader`)
//! - `DADALOADER_CONNECTIONS` (default 16)
//! - `DADALOADER_PAUSE_POLL_MS` (default 1000)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::downloader::engine::{Aria2EngineConfig, DEFAULT_CONNECTIONS};
use crate::downloader::{DownloadManagerConfig, SupervisorConfig};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:dadaloader.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_PAUSE_POLL_MS: u64 = 1000;
const MAX_CONNECTIONS: u32 = 16;

/// Runtime configuration for the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub aria2c_path: String,
    pub download_dir: PathBuf,
    pub connections: u32,
    pub pause_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            aria2c_path: "aria2c".to_string(),
            download_dir: default_download_dir(),
            connections: DEFAULT_CONNECTIONS,
            pause_poll_interval: Duration::from_millis(DEFAULT_PAUSE_POLL_MS),
        }
    }
}

/// `~/Downloads/dadaloader`, or `./downloads` without a home directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .map(|dir| dir.join("dadaloader"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

impl AppConfig {
    /// Load from the process environment. Call `dotenvy::dotenv()` first.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables. Blank values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = get("DADALOADER_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("DADALOADER_ARIA2C") {
            config.aria2c_path = path;
        }
        if let Some(dir) = get("DADALOADER_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(value) = get("DADALOADER_CONNECTIONS") {
            let connections: u32 = parse_value("DADALOADER_CONNECTIONS", &value)?;
            if !(1..=MAX_CONNECTIONS).contains(&connections) {
                return Err(Error::config(format!(
                    "DADALOADER_CONNECTIONS must be between 1 and {MAX_CONNECTIONS}, got {connections}"
                )));
            }
            config.connections = connections;
        }
        if let Some(value) = get("DADALOADER_PAUSE_POLL_MS") {
            let ms: u64 = parse_value("DADALOADER_PAUSE_POLL_MS", &value)?;
            if ms == 0 {
                return Err(Error::config("DADALOADER_PAUSE_POLL_MS must be positive"));
            }
            config.pause_poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn engine_config(&self) -> Aria2EngineConfig {
        Aria2EngineConfig {
            binary_path: self.aria2c_path.clone(),
            connections: self.connections,
            ..Default::default()
        }
    }

    pub fn manager_config(&self) -> DownloadManagerConfig {
        DownloadManagerConfig {
            supervisor: SupervisorConfig {
                pause_poll_interval: self.pause_poll_interval,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid {key} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.connections, 16);
        assert_eq!(config.pause_poll_interval, Duration::from_secs(1));
        assert!(config.download_dir.ends_with("dadaloader") || config.download_dir.ends_with("downloads"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "sqlite:/tmp/x.db"),
            ("DADALOADER_ARIA2C", "/opt/aria2c"),
            ("DADALOADER_CONNECTIONS", " 8 "),
            ("DADALOADER_PAUSE_POLL_MS", "250"),
            ("DADALOADER_LOG_DIR", ""),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite:/tmp/x.db");
        assert_eq!(config.engine_config().binary_path, "/opt/aria2c");
        assert_eq!(config.engine_config().connections, 8);
        assert_eq!(
            config.manager_config().supervisor.pause_poll_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
    }

    #[test]
    fn test_invalid_values() {
        for vars in [
            [("DADALOADER_CONNECTIONS", "lots")],
            [("DADALOADER_CONNECTIONS", "0")],
            [("DADALOADER_CONNECTIONS", "64")],
            [("DADALOADER_PAUSE_POLL_MS", "0")],
        ] {
            let err = load(&vars).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{vars:?}");
        }
    }
}
