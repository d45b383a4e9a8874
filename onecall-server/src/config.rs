//! Server configuration.
//!
//! Values come from defaults, then the YAML file named by `ONECALL_CONFIG`,
//! then `ONECALL_*` environment variables. Later sources win.

use onecall_protocol::SerializationKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "ONECALL_CONFIG";

/// Routes served next to the RPC path.
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Builds the effective configuration and validates it.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Defaults with environment overrides, without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        override_from_env("ONECALL_BIND", &mut self.network.bind_addr);
        override_from_env("ONECALL_RPC_PATH", &mut self.network.rpc_path);
        override_from_env("ONECALL_MAX_BODY_BYTES", &mut self.network.max_body_bytes);
        override_from_env("ONECALL_SERIALIZATION", &mut self.session.serialization);
        override_from_env("ONECALL_SESSION_TIMEOUT", &mut self.session.timeout_secs);
        if let Ok(flag) = std::env::var("ONECALL_METRICS_ENABLED") {
            self.metrics.enabled = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true");
        }
    }

    /// Rejects values that parse but cannot be served.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let path = &self.network.rpc_path;
        if !path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "rpc_path must start with '/': {}",
                path
            )));
        }
        if RESERVED_PATHS.contains(&path.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "rpc_path collides with a built-in route: {}",
                path
            )));
        }
        if self.network.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Replaces `slot` with the parsed value of `key`, if set and valid.
fn override_from_env<T>(key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!("Ignoring {}={:?}: {}", key, raw, e),
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "as_string")]
    pub bind_addr: SocketAddr,
    /// Path accepting batches.
    pub rpc_path: String,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            rpc_path: "/rpc".to_string(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serializer for request and response bodies.
    #[serde(with = "as_string")]
    pub serialization: SerializationKind,
    /// Longest a session may wait for its responses, 0 for no bound.
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serialization: SerializationKind::Json,
            timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` and record counters.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter for fields kept as strings in YAML.
mod as_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}
