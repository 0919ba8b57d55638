//! Client options.
//!
//! Options deserialize from any serde source; every field has a default so a
//! configuration only needs the credentials.

use crate::error::RealtimeError;
use ripple_protocol::Format;
use ripple_transport::TransportParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for a [`Realtime`](crate::Realtime) client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// API key, `appId.keyId:secret`.
    #[serde(default)]
    pub key: Option<String>,

    /// Access token used instead of a key.
    #[serde(default)]
    pub token: Option<String>,

    /// Client identity, required for presence.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Primary realtime host.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub tls: bool,

    /// Hosts tried when the primary host is unreachable.
    #[serde(default)]
    pub fallback_hosts: Vec<String>,

    #[serde(default)]
    pub format: Format,

    /// Receive messages published by this connection.
    #[serde(default = "default_true")]
    pub echo_messages: bool,

    /// Queue messages published while the connection is not yet connected.
    #[serde(default = "default_true")]
    pub queue_messages: bool,

    /// Connect as soon as the client is created.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Recovery key from a previous client instance.
    #[serde(default)]
    pub recover: Option<String>,

    #[serde(default = "default_realtime_request_timeout")]
    pub realtime_request_timeout_ms: u64,

    #[serde(default = "default_disconnected_retry_timeout")]
    pub disconnected_retry_timeout_ms: u64,

    #[serde(default = "default_suspended_retry_timeout")]
    pub suspended_retry_timeout_ms: u64,

    #[serde(default = "default_channel_retry_timeout")]
    pub channel_retry_timeout_ms: u64,

    /// Used until the service sends its own value.
    #[serde(default = "default_connection_state_ttl")]
    pub connection_state_ttl_ms: u64,
}

fn default_host() -> String {
    "realtime.ripple.io".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn default_realtime_request_timeout() -> u64 {
    10_000
}

fn default_disconnected_retry_timeout() -> u64 {
    15_000
}

fn default_suspended_retry_timeout() -> u64 {
    30_000
}

fn default_channel_retry_timeout() -> u64 {
    15_000
}

fn default_connection_state_ttl() -> u64 {
    120_000 // 2 minutes
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            client_id: None,
            host: default_host(),
            port: default_port(),
            tls: true,
            fallback_hosts: Vec::new(),
            format: Format::default(),
            echo_messages: true,
            queue_messages: true,
            auto_connect: true,
            recover: None,
            realtime_request_timeout_ms: default_realtime_request_timeout(),
            disconnected_retry_timeout_ms: default_disconnected_retry_timeout(),
            suspended_retry_timeout_ms: default_suspended_retry_timeout(),
            channel_retry_timeout_ms: default_channel_retry_timeout(),
            connection_state_ttl_ms: default_connection_state_ttl(),
        }
    }
}

impl ClientOptions {
    /// Options authenticating with an API key.
    #[must_use]
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Options authenticating with an access token.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Check the options before a client is built.
    ///
    /// # Errors
    ///
    /// Returns an error if no credentials are given or the key is malformed.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        match (&self.key, &self.token) {
            (None, None) => {
                return Err(RealtimeError::InvalidOptions(
                    "either a key or a token is required".into(),
                ))
            }
            (Some(key), _) => validate_key(key)?,
            _ => {}
        }

        if self.host.is_empty() {
            return Err(RealtimeError::InvalidOptions("host cannot be empty".into()));
        }
        if self.realtime_request_timeout_ms == 0 {
            return Err(RealtimeError::InvalidOptions(
                "realtime_request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn realtime_request_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    #[must_use]
    pub fn disconnected_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    #[must_use]
    pub fn suspended_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    #[must_use]
    pub fn channel_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_retry_timeout_ms)
    }

    /// Transport parameters for a connection attempt against `host`.
    #[must_use]
    pub fn transport_params(&self, host: &str) -> TransportParams {
        let mut params = TransportParams::new(host);
        params.port = self.port;
        params.tls = self.tls;
        params.format = self.format;
        params.key = self.key.clone();
        params.access_token = self.token.clone();
        params.client_id = self.client_id.clone();
        params.echo = self.echo_messages;
        params
    }
}

fn validate_key(key: &str) -> Result<(), RealtimeError> {
    let invalid = || RealtimeError::InvalidKey("key must be of the form appId.keyId:secret".into());

    let (name, secret) = key.split_once(':').ok_or_else(invalid)?;
    let (app_id, key_id) = name.split_once('.').ok_or_else(invalid)?;
    if app_id.is_empty() || key_id.is_empty() || secret.is_empty() {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.realtime_request_timeout(), Duration::from_secs(10));
        assert_eq!(options.disconnected_retry_timeout(), Duration::from_secs(15));
        assert_eq!(options.suspended_retry_timeout(), Duration::from_secs(30));
        assert_eq!(options.connection_state_ttl_ms, 120_000);
        assert!(options.queue_messages);
    }

    #[test]
    fn test_validate_key_format() {
        assert!(ClientOptions::with_key("app.key:secret").validate().is_ok());
        assert!(ClientOptions::with_token("token").validate().is_ok());

        for bad in ["appkey:secret", "app.key", "app.key:", ".key:secret"] {
            let err = ClientOptions::with_key(bad).validate().unwrap_err();
            assert!(matches!(err, RealtimeError::InvalidKey(_)), "{bad}");
        }

        assert!(matches!(
            ClientOptions::default().validate(),
            Err(RealtimeError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_from_json_with_defaults() {
        let options: ClientOptions = serde_json::from_str(
            r#"{"key":"app.key:secret","format":"json","fallback_hosts":["b.example.com"]}"#,
        )
        .unwrap();
        assert_eq!(options.format, Format::Json);
        assert_eq!(options.port, 443);
        assert_eq!(options.fallback_hosts, vec!["b.example.com".to_string()]);

        let params = options.transport_params("b.example.com");
        assert_eq!(params.host, "b.example.com");
        assert_eq!(params.key.as_deref(), Some("app.key:secret"));
    }
}
