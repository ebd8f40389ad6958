// Configuration loading (santa.toml) with built-in defaults for every field.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use draw_core::DEFAULT_ROSTER_SIZE;

const CONFIG_ENV: &str = "SANTA_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "santa.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub draw: DrawConfig,
    pub messages: MessagesConfig,
    pub roster: RosterConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub admin_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            admin_password: "changeme".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Primary tier. Set to an empty string to run on the JSON file alone.
    pub sqlite_path: String,
    pub json_path: PathBuf,
    pub debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "santa.db".to_string(),
            json_path: PathBuf::from("santa-session.json"),
            debounce_ms: 300,
        }
    }
}

impl StorageConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePolicy {
    /// Publish the reveal at once and fill in the message when it arrives.
    #[default]
    FireAndForget,
    /// Hold the reveal until the message is ready.
    Blocking,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrawConfig {
    pub roulette_ms: u64,
    pub tick_ms: u64,
    /// Fixed RNG seed for rehearsals; entropy when absent.
    pub seed: Option<u64>,
    pub message_policy: MessagePolicy,
    pub message_timeout_ms: u64,
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            roulette_ms: 2500,
            tick_ms: 80,
            seed: None,
            message_policy: MessagePolicy::default(),
            message_timeout_ms: 5000,
        }
    }
}

impl DrawConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Number of cosmetic frames before the authoritative pick.
    pub fn roulette_frames(&self) -> u64 {
        if self.tick_ms == 0 {
            return 0;
        }
        self.roulette_ms / self.tick_ms
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessagesConfig {
    /// Artificial pause before a templated message is returned.
    pub delay_ms: u64,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self { delay_ms: 600 }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RosterConfig {
    pub size: u32,
    /// JSON roster document used to seed a brand new session.
    pub path: Option<PathBuf>,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_ROSTER_SIZE,
            path: None,
        }
    }
}

impl Config {
    /// Parse and validate TOML text. Missing sections and fields take defaults.
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.draw.tick_ms == 0 {
            return Err(validation("draw.tick_ms", "must be greater than zero"));
        }
        if self.storage.debounce_ms == 0 {
            return Err(validation("storage.debounce_ms", "must be greater than zero"));
        }
        if self.roster.size == 0 {
            return Err(validation("roster.size", "must be greater than zero"));
        }
        if self.server.admin_password.is_empty() {
            return Err(validation("server.admin_password", "must not be empty"));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(password) = env::var("ADMIN_PASSWORD") {
            if !password.is_empty() {
                self.server.admin_password = password;
            }
        }
    }
}

fn validation(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Resolve the config file: explicit path, then `$SANTA_CONFIG`, then
/// `santa.toml` in the working directory. Only an explicitly named file is
/// required to exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

    let mut config = match named {
        Some(path) => Config::from_file(&path)?,
        None => {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            if local.exists() {
                Config::from_file(&local)?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
