//! Configuration loading and path management for Warden.
//!
//! Paths are rooted at `$WARDEN_HOME` when set, `~/.warden` otherwise.
//! Production code resolves the root once at process start; tests inject a
//! temp directory via `Paths::with_root`.

use fs_err as fs;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

pub const HOME_ENV: &str = "WARDEN_HOME";

/// Central configuration for all Warden paths.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolves the data root from `$WARDEN_HOME` or the home directory.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os(HOME_ENV) {
            return Ok(Self { root: root.into() });
        }
        let home = dirs::home_dir().ok_or(WardenError::HomeDirNotFound)?;
        Ok(Self {
            root: home.join(".warden"),
        })
    }

    /// Creates Paths with a custom root directory. Used for testing with
    /// temp directories.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config").join("warden.toml")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.root.join("storage")
    }
}

/// Broker connection settings plus the remediation command for a broker that
/// stops accepting connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub restart_command: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            restart_command: "systemctl restart mosquitto".to_string(),
        }
    }
}

/// Liveness-beacon settings for the dependent automation service, plus the
/// tiered remediation commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub topic: String,
    /// Expected seconds between beacons.
    pub interval: i64,
    /// Extra seconds tolerated on top of the interval before a beacon counts
    /// as missed.
    pub tolerance: i64,
    pub service_restart_command: String,
    pub system_reboot_command: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            topic: "homeassistant/heartbeat".to_string(),
            interval: 30,
            tolerance: 5,
            service_restart_command: "systemctl restart home-assistant".to_string(),
            system_reboot_command: "systemctl reboot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub broker: BrokerConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Loads configuration from a TOML file. A missing file yields defaults;
    /// a present but malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(WardenError::io("failed to read config", err)),
        };

        toml::from_str(&text).map_err(|err| WardenError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }
}
