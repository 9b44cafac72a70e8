//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TANDEM_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::NodeConfig;
use tandem_protocol::DEFAULT_PORT;
use thiserror::Error;

/// Longest accepted stream start window (one day).
pub const MAX_STREAM_START_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Longest accepted close linger (one minute).
pub const MAX_CLOSE_LINGER_MS: u64 = 60_000;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Settings of every per-connection RPC node.
    pub rpc: RpcConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TANDEM_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `TANDEM_*` overrides read through `var`. Unparsable values
    /// are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&var);
        self.rpc.apply_overrides(&var);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.rpc.max_transaction_attempts == 0 {
            return Err(ConfigError::Validation(
                "rpc.max_transaction_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_STREAM_START_TIMEOUT_SECS).contains(&self.rpc.stream_start_timeout_secs) {
            return Err(ConfigError::Validation(format!(
                "rpc.stream_start_timeout_secs must be between 1 and {}",
                MAX_STREAM_START_TIMEOUT_SECS
            )));
        }
        if self.rpc.close_linger_ms > MAX_CLOSE_LINGER_MS {
            return Err(ConfigError::Validation(format!(
                "rpc.close_linger_ms must be at most {}",
                MAX_CLOSE_LINGER_MS
            )));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    var(name).and_then(|value| value.trim().parse().ok())
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    var(name).map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = parse_override(var, "TANDEM_BIND") {
            self.bind_addr = addr;
        }
        if let Some(max) = parse_override(var, "TANDEM_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
    }
}

/// RPC node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Window for the peer to start an opened stream, in seconds.
    pub stream_start_timeout_secs: u64,
    /// How long finished streams absorb late frames, in milliseconds.
    pub close_linger_ms: u64,
    /// Attempts of one context transaction before giving up.
    pub max_transaction_attempts: usize,
    /// Whether every connection gets a synchronized session context.
    pub session_enabled: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            stream_start_timeout_secs: node.stream_start_timeout.as_secs(),
            close_linger_ms: node.close_linger.as_millis() as u64,
            max_transaction_attempts: node.max_transaction_attempts,
            session_enabled: true,
        }
    }
}

impl RpcConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(secs) = parse_override(var, "TANDEM_STREAM_START_TIMEOUT") {
            self.stream_start_timeout_secs = secs;
        }
        if let Some(ms) = parse_override(var, "TANDEM_CLOSE_LINGER_MS") {
            self.close_linger_ms = ms;
        }
        if let Some(attempts) = parse_override(var, "TANDEM_MAX_TRANSACTION_ATTEMPTS") {
            self.max_transaction_attempts = attempts;
        }
        if let Some(enabled) = parse_flag(var, "TANDEM_SESSION_ENABLED") {
            self.session_enabled = enabled;
        }
    }

    /// Builds the node configuration.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::new()
            .with_stream_start_timeout(Duration::from_secs(self.stream_start_timeout_secs))
            .with_close_linger(Duration::from_millis(self.close_linger_ms))
            .with_max_transaction_attempts(self.max_transaction_attempts)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serializes socket addresses as strings in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(addr)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.rpc.node_config(), NodeConfig::default());
        assert!(config.rpc.session_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\n\
             rpc:\n  close_linger_ms: 250\n  session_enabled: false"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(
            config.rpc.node_config().close_linger,
            Duration::from_millis(250)
        );
        assert!(!config.rpc.session_enabled);
    }

    #[test]
    fn test_from_file_errors() {
        let err = Config::from_file("/nonexistent/tandem.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network:\n  bind_addr: \"not an address\"").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TANDEM_BIND", "127.0.0.1:7500"),
            ("TANDEM_MAX_CONNECTIONS", "8"),
            ("TANDEM_STREAM_START_TIMEOUT", "5"),
            ("TANDEM_MAX_TRANSACTION_ATTEMPTS", "garbage"),
            ("TANDEM_SESSION_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 7500);
        assert_eq!(config.network.max_connections, 8);
        assert_eq!(
            config.rpc.node_config().stream_start_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(
            config.rpc.max_transaction_attempts,
            RpcConfig::default().max_transaction_attempts
        );
        assert!(!config.rpc.session_enabled);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.network.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rpc_ranges() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.apply_overrides(|name| {
            (name == "TANDEM_STREAM_START_TIMEOUT").then(|| u64::MAX.to_string())
        });
        assert_eq!(config.rpc.stream_start_timeout_secs, u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));

        config.rpc.stream_start_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.rpc.stream_start_timeout_secs = MAX_STREAM_START_TIMEOUT_SECS;
        assert!(config.validate().is_ok());

        config.rpc.close_linger_ms = MAX_CLOSE_LINGER_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.rpc.close_linger_ms, config.rpc.close_linger_ms);
    }
}
