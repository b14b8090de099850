//! Configuration loading and typed config structures for the Switchboard
//! server.
//!
//! The configuration lives in a YAML file, `switchboard.yaml` by default
//! (override the path with `SWITCHBOARD_CONFIG`). Every key is optional; a
//! missing file means all defaults. A handful of environment variables
//! override the file, see [`ServerConfig::apply_overrides`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use switchboard_store::StoreOptions;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SWITCHBOARD_CONFIG";
/// Configuration file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "switchboard.yaml";

/// Why `switchboard.yaml` could not be turned into a [`ServerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read switchboard config: {source}")]
    Io {
        /// Read failure.
        #[from]
        source: std::io::Error,
    },

    /// The file is not valid YAML or has a mistyped key.
    #[error("invalid switchboard config: {source}")]
    Yaml {
        /// Decoder error, with line and column when known.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Address the operator listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Persisted state settings.
    #[serde(default)]
    pub state: StateConfig,

    /// Operator connection settings.
    #[serde(default)]
    pub operators: OperatorsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`from_file`](Self::from_file), but a missing file yields the
    /// defaults (still subject to environment overrides).
    ///
    /// # Errors
    ///
    /// Same as [`from_file`](Self::from_file) for any failure other than
    /// the file not existing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let mut config = Self::parse(&contents)?;
                config.apply_env_overrides();
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse configuration from a YAML string. No overrides are applied.
    ///
    /// An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`:
    /// - `SWITCHBOARD_LISTEN` overrides `listen`
    /// - `SWITCHBOARD_STATE_FILE` overrides `state.path`
    /// - `SWITCHBOARD_LOG` overrides `logging.level`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SWITCHBOARD_LISTEN") {
            self.listen = val;
        }
        if let Some(val) = lookup("SWITCHBOARD_STATE_FILE") {
            self.state.path = val;
        }
        if let Some(val) = lookup("SWITCHBOARD_LOG") {
            self.logging.level = val;
        }
    }

    /// Configuration file path taken from the environment.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state: StateConfig::default(),
            operators: OperatorsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Persisted state configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StateConfig {
    /// Backing file. Empty keeps the state in memory only.
    #[serde(default = "default_state_path")]
    pub path: String,

    /// Permission bits of the backing file. Accepts an integer or an octal
    /// string such as `"0640"`.
    #[serde(default = "default_file_mode", deserialize_with = "octal_mode")]
    pub file_mode: u32,

    /// Debounce window in milliseconds. Zero writes on every change.
    #[serde(default)]
    pub write_delay_ms: u64,

    /// How many implant sightings are remembered. Applied to the loaded
    /// state at startup and passed to [`crate::implant::check_in`] by the
    /// implant transport.
    #[serde(default = "default_last_seen_capacity")]
    pub last_seen_capacity: usize,
}

impl StateConfig {
    /// Persistence options for the document manager.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            path: (!self.path.is_empty()).then(|| PathBuf::from(&self.path)),
            file_mode: self.file_mode,
            write_delay: Duration::from_millis(self.write_delay_ms),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            file_mode: default_file_mode(),
            write_delay_ms: 0,
            last_seen_capacity: default_last_seen_capacity(),
        }
    }
}

/// Operator connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OperatorsConfig {
    /// How long a new connection has to announce its name.
    #[serde(default = "default_name_timeout_ms")]
    pub name_timeout_ms: u64,

    /// Pause after the process runs out of file descriptors.
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,

    /// Log lines queued per operator before its log feed is dropped.
    #[serde(default = "default_log_pipe_capacity")]
    pub log_pipe_capacity: usize,
}

impl OperatorsConfig {
    /// [`name_timeout_ms`](Self::name_timeout_ms) as a [`Duration`].
    pub const fn name_timeout(&self) -> Duration {
        Duration::from_millis(self.name_timeout_ms)
    }

    /// [`accept_backoff_ms`](Self::accept_backoff_ms) as a [`Duration`].
    pub const fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

impl Default for OperatorsConfig {
    fn default() -> Self {
        Self {
            name_timeout_ms: default_name_timeout_ms(),
            accept_backoff_ms: default_accept_backoff_ms(),
            log_pipe_capacity: default_log_pipe_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:7443".to_owned()
}

fn default_state_path() -> String {
    "switchboard-state.json".to_owned()
}

const fn default_file_mode() -> u32 {
    0o600
}

const fn default_last_seen_capacity() -> usize {
    switchboard_types::DEFAULT_LAST_SEEN_CAPACITY
}

const fn default_name_timeout_ms() -> u64 {
    5_000
}

const fn default_accept_backoff_ms() -> u64 {
    1_000
}

const fn default_log_pipe_capacity() -> usize {
    8_192
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn octal_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Mode {
        Bits(u32),
        Octal(String),
    }

    match Mode::deserialize(deserializer)? {
        Mode::Bits(bits) => Ok(bits),
        Mode::Octal(text) => {
            let digits = text.trim_start_matches("0o");
            u32::from_str_radix(digits, 8).map_err(serde::de::Error::custom)
        }
    }
}
