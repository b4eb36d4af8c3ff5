//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_HOST, RELAY_PORT)
//! - TOML configuration file
//! - Command line arguments (`--config`)

use anyhow::{bail, Context, Result};
use relay_core::{HubConfig, OverflowPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Static asset serving.
    #[serde(default)]
    pub static_files: StaticFilesConfig,

    /// Hub behaviour.
    #[serde(default)]
    pub hub: HubSection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Static asset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFilesConfig {
    /// Serve files at `/`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory to serve.
    #[serde(default = "default_static_dir")]
    pub dir: PathBuf,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Frames buffered per connection before the overflow policy applies.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// What to do with a connection whose buffer is full.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Send messages back to the connection they came from.
    #[serde(default)]
    pub echo_to_sender: bool,

    /// Time allowed for closing a connection's transport, in milliseconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub counters are exported, in milliseconds.
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_close_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_report_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            static_files: StaticFilesConfig::default(),
            hub: HubSection::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_static_dir(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            overflow_policy: OverflowPolicy::default(),
            echo_to_sender: false,
            close_timeout_ms: default_close_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            report_interval_ms: default_report_interval(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit file, the default paths, or
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if the
    /// resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_default_paths()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check values that would otherwise fail at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        if self.hub.outbound_capacity == 0 {
            bail!("hub.outbound_capacity must be greater than zero");
        }
        if self.limits.max_connections == 0 {
            bail!("limits.max_connections must be greater than zero");
        }
        if self.limits.max_message_size == 0 {
            bail!("limits.max_message_size must be greater than zero");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Hub settings in the form the hub takes them.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.hub.outbound_capacity,
            overflow_policy: self.hub.overflow_policy,
            echo_to_sender: self.hub.echo_to_sender,
            close_timeout: Duration::from_millis(self.hub.close_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert!(config.static_files.enabled);
        assert_eq!(config.hub.overflow_policy, OverflowPolicy::Disconnect);
        assert!(!config.hub.echo_to_sender);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let config = Config {
            host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [hub]
            outbound_capacity = 32
            overflow_policy = "drop_message"
            echo_to_sender = true

            [limits]
            max_connections = 50000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_message_size, 64 * 1024);

        let hub = config.hub_config();
        assert_eq!(hub.outbound_capacity, 32);
        assert_eq!(hub.overflow_policy, OverflowPolicy::DropMessage);
        assert!(hub.echo_to_sender);
        assert_eq!(hub.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transport.websocket_path = "ws".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hub.outbound_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_overflow_policy_rejected() {
        let toml_str = r#"
            [hub]
            overflow_policy = "block"
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }
}
