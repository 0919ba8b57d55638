//! WebSocket connector.
//!
//! This module provides a WebSocket-based socket using tokio-tungstenite.
//! Binary frames carry MessagePack envelopes, text frames carry JSON.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ripple_protocol::{codec, Format, ProtocolError, ProtocolMessage};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::driver::SocketTransportFactory;
use crate::traits::{Connector, Socket, TransportError, TransportParams};

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Opens WebSocket connections to the service.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// A transport factory using this connector.
    #[must_use]
    pub fn into_factory(self) -> SocketTransportFactory {
        SocketTransportFactory::new(Arc::new(self))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, params: &TransportParams) -> Result<Box<dyn Socket>, TransportError> {
        let url = params.url();
        debug!(host = %params.host, port = params.port, "Connecting WebSocket");

        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::ConnectFailed(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!(host = %params.host, "WebSocket handshake completed");

        Ok(Box::new(WebSocketSocket {
            stream,
            format: params.format,
            remote: format!("{}:{}", params.host, params.port),
            max_message_size: self.config.max_message_size,
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// An open WebSocket carrying protocol envelopes.
pub struct WebSocketSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    format: Format,
    remote: String,
    max_message_size: usize,
}

impl WebSocketSocket {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl Socket for WebSocketSocket {
    async fn recv(&mut self) -> Result<Option<ProtocolMessage>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(codec::decode(&data, Format::MsgPack)?));
                }
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode(text.as_bytes(), Format::Json)?));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        let data = codec::encode(&message, self.format)?;
        let frame = match self.format {
            Format::MsgPack => Message::Binary(data.to_vec()),
            Format::Json => Message::Text(String::from_utf8_lossy(&data).into_owned()),
        };
        self.stream
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(WebSocketConnector::default().name(), "websocket");
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connect_failed() {
        let mut params = TransportParams::new("127.0.0.1");
        params.tls = false;
        params.port = 1;

        let result = WebSocketConnector::default().connect(&params).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
