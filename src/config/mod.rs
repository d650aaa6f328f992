//! Configuration module
//!
//! Handles loading and saving flatlink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::NetworkConfig;
use crate::protocol::{DEFAULT_PORT, MAX_FRAME_BYTES};
use crate::transport::TransportConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Call and framing settings
    #[serde(default)]
    pub transport: TransportSection,

    /// Ping/pong settings
    #[serde(default)]
    pub liveness: LivenessConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Default time to wait for a response, in ms
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Time to wait for a peer when none is connected, in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Largest encoded frame accepted or sent
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Fail in-flight calls as soon as their connection drops
    #[serde(default)]
    pub fail_pending_on_disconnect: bool,
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            fail_pending_on_disconnect: false,
        }
    }
}

/// Liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Ping interval in ms (0 disables probing)
    #[serde(default = "default_liveness_interval")]
    pub interval_ms: u64,
    /// Drop a connection after this long without a pong, in ms
    #[serde(default = "default_liveness_timeout")]
    pub timeout_ms: u64,
}

fn default_liveness_interval() -> u64 {
    15_000
}

fn default_liveness_timeout() -> u64 {
    45_000
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_liveness_interval(),
            timeout_ms: default_liveness_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("flatlink/config.toml")),
            Some(PathBuf::from("./flatlink.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading config from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the transport cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.transport.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.transport.max_frame_bytes < 64 {
            return Err(ConfigError::Invalid(format!(
                "transport.max_frame_bytes too small: {}",
                self.transport.max_frame_bytes
            )));
        }
        if self.liveness.interval_ms > 0 && self.liveness.timeout_ms < self.liveness.interval_ms {
            return Err(ConfigError::Invalid(
                "liveness.timeout_ms must be at least liveness.interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Coordinator settings
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            request_timeout_ms: self.transport.request_timeout_ms,
            connect_timeout_ms: self.transport.connect_timeout_ms,
            max_frame_bytes: self.transport.max_frame_bytes,
            fail_pending_on_disconnect: self.transport.fail_pending_on_disconnect,
            ..TransportConfig::default()
        }
        .with_liveness(self.liveness.interval_ms, self.liveness.timeout_ms)
    }

    /// Socket settings. The link accepts a little more than one frame so
    /// oversized frames still reach the coordinator and get an answer.
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            bind_address: self.server.bind_address.clone(),
            port: self.server.port,
            connect_timeout_ms: self.transport.connect_timeout_ms,
            max_message_size: self.transport.max_frame_bytes.saturating_mul(4).max(64 * 1024),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        },
        transport: TransportSection {
            request_timeout_ms: 3000,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.transport.max_frame_bytes, MAX_FRAME_BYTES);
        assert!(!config.transport.fail_pending_on_disconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.transport.fail_pending_on_disconnect = true;
        config.liveness.interval_ms = 0;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert!(loaded.transport.fail_pending_on_disconnect);
        assert_eq!(loaded.liveness.interval_ms, 0);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nrequest_timeout_ms = 250").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.transport.request_timeout_ms, 250);
        assert_eq!(loaded.transport.connect_timeout_ms, 2000);
        assert_eq!(loaded.server.bind_address, "0.0.0.0");
        assert_eq!(loaded.liveness.timeout_ms, 45_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[liveness]\ninterval_ms = 1000\ntimeout_ms = 10").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nrequest_timeout_ms = \"soon\"").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(Config::load(&path), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_conversions() {
        let mut config = Config::default();
        config.transport.request_timeout_ms = 1234;
        config.liveness.interval_ms = 0;

        let transport = config.transport_config();
        assert_eq!(transport.request_timeout_ms, 1234);
        assert_eq!(transport.liveness_interval_ms, 0);
        assert_eq!(
            transport.call_options().timeout,
            std::time::Duration::from_millis(1234)
        );

        let network = config.network_config();
        assert_eq!(network.port, DEFAULT_PORT);
        assert!(network.max_message_size > config.transport.max_frame_bytes);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.bind_address, "127.0.0.1");
        assert_eq!(parsed.transport.request_timeout_ms, 3000);
    }
}
