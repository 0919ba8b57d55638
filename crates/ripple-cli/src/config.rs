//! CLI configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`ripple.toml`, `/etc/ripple/ripple.toml`,
//!   `~/.config/ripple/ripple.toml`, or `--config <path>`)
//! - Environment variables (`RIPPLE__CLIENT__KEY`, `RIPPLE__CHANNELS`, ...)

use anyhow::{Context, Result};
use ripple_core::ClientOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const CONFIG_PATHS: [&str; 3] = [
    "ripple.toml",
    "/etc/ripple/ripple.toml",
    "~/.config/ripple/ripple.toml",
];

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client options passed to the engine.
    #[serde(default)]
    pub client: ClientOptions,

    /// Channels to attach to. Lines read from stdin are published on the
    /// first one.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Event name for published lines.
    #[serde(default = "default_event")]
    pub event: String,

    /// Enter presence on every channel with this data.
    #[serde(default)]
    pub presence: Option<serde_json::Value>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Address of the Prometheus endpoint.
    #[serde(default = "default_metrics_host")]
    pub host: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_event() -> String {
    "message".to_string()
}

fn default_metrics_host() -> String {
    "127.0.0.1".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            channels: Vec::new(),
            event: default_event(),
            presence: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the first default path that
    /// exists, with environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find(),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(file.as_path()).required(path.is_some()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RIPPLE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("channels")
                .with_list_parse_key("client.fallback_hosts"),
        );

        let settings = builder.build().context("Failed to load configuration")?;
        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// First default config path that exists.
    fn find() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without overrides.
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

    /// Address of the metrics endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.metrics.host, self.metrics.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid metrics address: {}:{}",
                    self.metrics.host, self.metrics.port
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.channels.is_empty());
        assert_eq!(config.event, "message");
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics_addr().unwrap().port(), 9091);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            channels = ["chat:lobby", "chat:ops"]
            presence = { status = "online" }

            [client]
            key = "app.key:secret"
            client_id = "cli"
            fallback_hosts = ["a.example.com", "b.example.com"]
            realtime_request_timeout_ms = 5000

            [metrics]
            enabled = true
            port = 9500
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.channels, vec!["chat:lobby", "chat:ops"]);
        assert_eq!(config.client.key.as_deref(), Some("app.key:secret"));
        assert_eq!(config.client.fallback_hosts.len(), 2);
        assert_eq!(config.client.realtime_request_timeout_ms, 5000);
        assert_eq!(config.client.connection_state_ttl_ms, 120_000);
        assert_eq!(
            config.presence,
            Some(serde_json::json!({ "status": "online" }))
        );
        assert!(config.client.validate().is_ok());
        assert_eq!(config.metrics_addr().unwrap().port(), 9500);
    }

    #[test]
    fn test_from_missing_file_fails() {
        assert!(Config::from_file("/nonexistent/ripple.toml").is_err());
    }
}
