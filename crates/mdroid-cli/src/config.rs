//! Configuration Vault – reads/writes `~/.mdroid/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mdroid_policy::PolicyConfig;
use mdroid_serial::LinkConfig;
use mdroid_store::Cooldown;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One microcontroller port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDevice {
    /// Device path, e.g. `/dev/ttyACM0`.
    pub device: String,

    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Persisted hub configuration stored in `~/.mdroid/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// JSON file holding user settings.
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,

    /// When set, the state store is restored from this file at boot and
    /// saved back on shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,

    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// How long power and lock commands wait for the vehicle to confirm.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Cooldown for the power policy hooks; `0` re-evaluates on every write.
    #[serde(default)]
    pub hook_cooldown_ms: u64,

    #[serde(default = "default_autolock_cooldown_secs")]
    pub autolock_cooldown_secs: u64,

    /// Values written through the state store at boot, so their hooks fire
    /// once.  Booleans and numbers are accepted as well as strings.
    #[serde(default)]
    pub initial_state: BTreeMap<String, toml::Value>,

    /// Serial ports to supervise.  The first one to open takes the writer
    /// role.
    #[serde(default)]
    pub serial: Vec<SerialDevice>,
}

fn default_baud() -> u32 {
    115_200
}
fn default_settings_file() -> PathBuf {
    mdroid_dir(&home_dir()).join("settings.json")
}
fn default_reconnect_backoff_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    10
}
fn default_ack_timeout_ms() -> u64 {
    3000
}
fn default_autolock_cooldown_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
            session_file: None,
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
            hook_cooldown_ms: 0,
            autolock_cooldown_secs: default_autolock_cooldown_secs(),
            initial_state: BTreeMap::new(),
            serial: Vec::new(),
        }
    }
}

impl Config {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
        }
    }

    pub fn policy_config(&self) -> PolicyConfig {
        let power_cooldown = match self.hook_cooldown_ms {
            0 => Cooldown::Always,
            ms => Cooldown::Every(Duration::from_millis(ms)),
        };
        PolicyConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            power_cooldown,
            autolock_cooldown: Duration::from_secs(self.autolock_cooldown_secs),
            ..PolicyConfig::default()
        }
    }

    /// `initial_state` as store values; tables and arrays are skipped.
    pub fn initial_state(&self) -> Vec<(String, String)> {
        self.initial_state
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    toml::Value::Boolean(b) => mdroid_types::bool_text(*b).to_string(),
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::String(s) => s.to_uppercase(),
                    _ => return None,
                };
                Some((key.clone(), value))
            })
            .collect()
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn mdroid_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mdroid")
}

/// Return the path to `~/.mdroid/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    mdroid_dir(home).join("config.toml")
}

/// Load the config from `explicit` or `~/.mdroid/config.toml`, then apply
/// environment overrides.  The flag reports whether a file was found;
/// without one the defaults are used.
pub fn load(explicit: Option<&Path>) -> Result<(Config, bool), ConfigError> {
    let path = explicit.map_or_else(config_path, Path::to_path_buf);
    let loaded = load_from(&path)?;
    let found = loaded.is_some();
    let mut cfg = loaded.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok((cfg, found))
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Apply `MDROID_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MDROID_SERIAL_DEVICE` | replaces `serial` with this single device |
/// | `MDROID_SERIAL_BAUD` | `baud` of every serial device |
/// | `MDROID_SETTINGS_FILE` | `settings_file` |
/// | `MDROID_SESSION_FILE` | `session_file` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(device) = std::env::var("MDROID_SERIAL_DEVICE") {
        let baud = cfg.serial.first().map_or_else(default_baud, |d| d.baud);
        cfg.serial = vec![SerialDevice { device, baud }];
    }
    if let Ok(v) = std::env::var("MDROID_SERIAL_BAUD")
        && let Ok(baud) = v.parse::<u32>()
    {
        for device in &mut cfg.serial {
            device.baud = baud;
        }
    }
    if let Ok(v) = std::env::var("MDROID_SETTINGS_FILE") {
        cfg.settings_file = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MDROID_SESSION_FILE") {
        cfg.session_file = Some(PathBuf::from(v));
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)
}
