//! Transport collaborator traits.
//!
//! The engine consumes a [`Transport`]: a handle it can ask to connect, send
//! and close, and which reports back through a [`TransportListener`]. The
//! listener only ever enqueues work for the engine, so implementations may
//! call it from any task.
//!
//! Concrete transports are usually built from a [`Connector`] producing
//! [`Socket`]s, driven by [`SocketTransport`](crate::driver::SocketTransport).

use async_trait::async_trait;
use ripple_protocol::{ErrorInfo, Format, ProtocolError, ProtocolMessage, PROTOCOL_VERSION};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to establish the connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Describe this failure for the engine. Network-level failures carry
    /// status 0 so fallback host selection treats them as retriable.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            TransportError::Timeout => ErrorInfo::connection_timeout(),
            TransportError::Protocol(e) => {
                ErrorInfo::new(ErrorInfo::BAD_REQUEST, 400, e.to_string())
            }
            other => ErrorInfo::new(ErrorInfo::DISCONNECTED, 0, other.to_string()),
        }
    }
}

/// Lifecycle of a single transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Initialized,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub format: Format,
    pub key: Option<String>,
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub echo: bool,
    /// Connection key of the connection to resume.
    pub resume: Option<String>,
    pub connection_serial: Option<i64>,
    /// Connection key taken from a recovery key.
    pub recover: Option<String>,
}

impl TransportParams {
    /// Create parameters for a host with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 443,
            tls: true,
            format: Format::MsgPack,
            key: None,
            access_token: None,
            client_id: None,
            echo: true,
            resume: None,
            connection_serial: None,
            recover: None,
        }
    }

    /// Query parameters sent on connect.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("v", PROTOCOL_VERSION.as_param()),
            ("format", self.format.as_param().to_string()),
            ("echo", self.echo.to_string()),
        ];

        if let Some(token) = &self.access_token {
            pairs.push(("accessToken", token.clone()));
        } else if let Some(key) = &self.key {
            pairs.push(("key", key.clone()));
        }
        if let Some(client_id) = &self.client_id {
            pairs.push(("clientId", client_id.clone()));
        }
        if let Some(resume) = &self.resume {
            pairs.push(("resume", resume.clone()));
            if let Some(serial) = self.connection_serial {
                pairs.push(("connectionSerial", serial.to_string()));
            }
        } else if let Some(recover) = &self.recover {
            pairs.push(("recover", recover.clone()));
        }

        pairs
    }

    /// The full connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        let query: Vec<String> = self
            .query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, encode_component(&v)))
            .collect();
        format!("{}://{}:{}/?{}", scheme, self.host, self.port, query.join("&"))
    }
}

fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Receives connectivity events from a transport.
pub trait TransportListener: Send + Sync {
    /// The transport is open and able to carry envelopes.
    fn on_connected(&self);

    /// The transport was lost or could not be opened.
    fn on_disconnected(&self, error: Option<ErrorInfo>);

    /// A decoded envelope arrived.
    fn on_message_received(&self, message: ProtocolMessage);
}

/// A transport handle owned by the engine.
pub trait Transport: Send {
    /// Start opening the connection. Completion is reported to the listener.
    fn connect(&mut self);

    /// Queue an envelope for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not connected.
    fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError>;

    /// Close the connection. No further listener events are delivered.
    fn close(&mut self);

    /// Current transport state.
    fn state(&self) -> TransportState;
}

/// Creates transports for the engine.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Box<dyn Transport>;
}

/// An open bidirectional envelope stream.
#[async_trait]
pub trait Socket: Send {
    /// Receive the next envelope.
    ///
    /// Returns `None` if the socket closed cleanly. Must be cancel safe: it
    /// is polled inside `select!` alongside outbound traffic.
    async fn recv(&mut self) -> Result<Option<ProtocolMessage>, TransportError>;

    /// Send an envelope.
    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError>;

    /// Close the socket gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the socket, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// Opens sockets (e.g. "websocket").
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &TransportParams) -> Result<Box<dyn Socket>, TransportError>;

    /// Get the connector name.
    fn name(&self) -> &'static str;
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Initialized => "initialized",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_prefers_resume_over_recover() {
        let mut params = TransportParams::new("realtime.example.com");
        params.key = Some("app.key:secret".into());
        params.resume = Some("conn-key".into());
        params.connection_serial = Some(7);
        params.recover = Some("old-key".into());

        let pairs = params.query_pairs();
        assert!(pairs.contains(&("resume", "conn-key".to_string())));
        assert!(pairs.contains(&("connectionSerial", "7".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "recover"));
        assert!(pairs.contains(&("v", "2".to_string())));
    }

    #[test]
    fn test_url_encodes_credentials() {
        let mut params = TransportParams::new("localhost");
        params.tls = false;
        params.port = 8080;
        params.key = Some("app.key:secret".into());

        let url = params.url();
        assert!(url.starts_with("ws://localhost:8080/?v=2&format=msgpack&echo=true"));
        assert!(url.contains("key=app.key%3Asecret"));
    }

    #[test]
    fn test_error_info_mapping() {
        let info = TransportError::ConnectionClosed.to_error_info();
        assert_eq!(info.code, ErrorInfo::DISCONNECTED);
        assert_eq!(info.status_code, 0);
        assert_eq!(TransportError::Timeout.to_error_info().code, ErrorInfo::TIMEOUT);
    }
}
