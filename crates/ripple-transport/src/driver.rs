//! Drives a [`Connector`] as a [`Transport`].
//!
//! Each transport owns one background task: it opens the socket, forwards
//! outbound envelopes queued by the engine, and reports inbound envelopes and
//! connectivity changes to the listener.

use crate::traits::{
    Connector, Socket, Transport, TransportError, TransportFactory, TransportListener,
    TransportParams, TransportState,
};
use ripple_protocol::ProtocolMessage;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

enum Outbound {
    Message(ProtocolMessage),
    Close,
}

enum Event {
    Outbound(Option<Outbound>),
    Inbound(Result<Option<ProtocolMessage>, TransportError>),
}

type SharedState = Arc<Mutex<TransportState>>;

fn set_state(shared: &SharedState, state: TransportState) {
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = state;
}

/// A transport backed by a socket connector.
pub struct SocketTransport {
    connector: Arc<dyn Connector>,
    params: TransportParams,
    listener: Arc<dyn TransportListener>,
    state: SharedState,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

impl SocketTransport {
    /// Create a transport that will connect with `connector`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Self {
        Self {
            connector,
            params,
            listener,
            state: Arc::new(Mutex::new(TransportState::Initialized)),
            outbound: None,
            task: None,
        }
    }
}

impl Transport for SocketTransport {
    fn connect(&mut self) {
        if self.task.is_some() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("Transport connect requested outside a tokio runtime");
                set_state(&self.state, TransportState::Closed);
                self.listener.on_disconnected(Some(
                    TransportError::ConnectFailed("no async runtime".into()).to_error_info(),
                ));
                return;
            }
        };

        set_state(&self.state, TransportState::Connecting);
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);

        let connector = self.connector.clone();
        let params = self.params.clone();
        let listener = self.listener.clone();
        let state = self.state.clone();

        self.task = Some(handle.spawn(async move {
            run_socket(connector, params, listener, state, rx).await;
        }));
    }

    fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::ConnectionClosed);
        }
        let outbound = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&mut self) {
        set_state(&self.state, TransportState::Closing);
        match self.outbound.take() {
            Some(outbound) => {
                // The task closes the socket and exits once the queue drains.
                let _ = outbound.send(Outbound::Close);
            }
            None => set_state(&self.state, TransportState::Closed),
        }
        self.task = None;
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_socket(
    connector: Arc<dyn Connector>,
    params: TransportParams,
    listener: Arc<dyn TransportListener>,
    state: SharedState,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    debug!(connector = connector.name(), host = %params.host, "Opening socket");

    let mut socket: Box<dyn Socket> = match connector.connect(&params).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(connector = connector.name(), error = %e, "Socket connect failed");
            set_state(&state, TransportState::Closed);
            listener.on_disconnected(Some(e.to_error_info()));
            return;
        }
    };

    set_state(&state, TransportState::Connected);
    listener.on_connected();

    loop {
        let event = tokio::select! {
            out = outbound.recv() => Event::Outbound(out),
            inbound = socket.recv() => Event::Inbound(inbound),
        };

        match event {
            Event::Outbound(Some(Outbound::Message(message))) => {
                trace!(action = ?message.action, "Sending envelope");
                if let Err(e) = socket.send(message).await {
                    warn!(error = %e, "Socket send failed");
                    set_state(&state, TransportState::Closed);
                    listener.on_disconnected(Some(e.to_error_info()));
                    return;
                }
            }
            Event::Outbound(Some(Outbound::Close)) | Event::Outbound(None) => {
                if let Err(e) = socket.close().await {
                    debug!(error = %e, "Socket close failed");
                }
                set_state(&state, TransportState::Closed);
                return;
            }
            Event::Inbound(Ok(Some(message))) => {
                trace!(action = ?message.action, "Received envelope");
                listener.on_message_received(message);
            }
            Event::Inbound(Ok(None)) => {
                debug!("Socket closed by peer");
                set_state(&state, TransportState::Closed);
                listener.on_disconnected(None);
                return;
            }
            Event::Inbound(Err(e)) => {
                warn!(error = %e, "Socket receive failed");
                set_state(&state, TransportState::Closed);
                listener.on_disconnected(Some(e.to_error_info()));
                return;
            }
        }
    }
}

/// Factory producing [`SocketTransport`]s from one connector.
pub struct SocketTransportFactory {
    connector: Arc<dyn Connector>,
}

impl SocketTransportFactory {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

impl TransportFactory for SocketTransportFactory {
    fn create(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Box<dyn Transport> {
        Box::new(SocketTransport::new(self.connector.clone(), params, listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ripple_protocol::{Action, ErrorInfo};
    use tokio::sync::Mutex as AsyncMutex;

    /// A socket fed by channels.
    struct ChannelSocket {
        inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
        sent: mpsc::UnboundedSender<ProtocolMessage>,
    }

    #[async_trait]
    impl Socket for ChannelSocket {
        async fn recv(&mut self) -> Result<Option<ProtocolMessage>, TransportError> {
            Ok(self.inbound.recv().await)
        }

        async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
            self.sent
                .send(message)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct ChannelConnector {
        socket: AsyncMutex<Option<ChannelSocket>>,
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn connect(
            &self,
            _params: &TransportParams,
        ) -> Result<Box<dyn Socket>, TransportError> {
            match self.socket.lock().await.take() {
                Some(socket) => Ok(Box::new(socket)),
                None => Err(TransportError::ConnectFailed("refused".into())),
            }
        }

        fn name(&self) -> &'static str {
            "channel"
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
        notify: tokio::sync::Notify,
    }

    impl TransportListener for Recorder {
        fn on_connected(&self) {
            self.events.lock().unwrap().push("connected".into());
            self.notify.notify_one();
        }

        fn on_disconnected(&self, error: Option<ErrorInfo>) {
            let code = error.map(|e| e.code).unwrap_or(0);
            self.events.lock().unwrap().push(format!("disconnected:{code}"));
            self.notify.notify_one();
        }

        fn on_message_received(&self, message: ProtocolMessage) {
            self.events
                .lock()
                .unwrap()
                .push(format!("message:{}", u8::from(message.action)));
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn test_socket_transport_round_trip() {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ChannelConnector {
            socket: AsyncMutex::new(Some(ChannelSocket {
                inbound: inbound_rx,
                sent: sent_tx,
            })),
        });
        let recorder = Arc::new(Recorder::default());

        let factory = SocketTransportFactory::new(connector);
        let mut transport = factory.create(TransportParams::new("localhost"), recorder.clone());
        assert!(transport.send(ProtocolMessage::heartbeat(None)).is_err());

        transport.connect();
        recorder.notify.notified().await;
        assert_eq!(transport.state(), TransportState::Connected);

        transport.send(ProtocolMessage::attach("room")).unwrap();
        let sent = sent_rx.recv().await.unwrap();
        assert_eq!(sent.action, Action::Attach);

        inbound_tx.send(ProtocolMessage::new(Action::Attached)).unwrap();
        recorder.notify.notified().await;

        drop(inbound_tx);
        recorder.notify.notified().await;

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["connected", "message:11", "disconnected:0"]);
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        let connector = Arc::new(ChannelConnector {
            socket: AsyncMutex::new(None),
        });
        let recorder = Arc::new(Recorder::default());
        let mut transport =
            SocketTransport::new(connector, TransportParams::new("localhost"), recorder.clone());

        transport.connect();
        recorder.notify.notified().await;

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec![format!("disconnected:{}", ErrorInfo::DISCONNECTED)]);
    }
}
