//! In-memory transport.
//!
//! Records every envelope the engine sends and lets the caller inject
//! connectivity events and inbound envelopes. Used by tests and benchmarks
//! to drive the engine without a network.

use crate::traits::{
    Transport, TransportError, TransportFactory, TransportListener, TransportParams,
    TransportState,
};
use ripple_protocol::{ErrorInfo, ProtocolMessage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Inner {
    params: TransportParams,
    listener: Arc<dyn TransportListener>,
    state: TransportState,
    sent: Vec<ProtocolMessage>,
    connect_calls: usize,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side handle to one in-memory transport.
#[derive(Clone)]
pub struct MemoryTransportHandle {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransportHandle {
    /// Parameters the transport was created with.
    #[must_use]
    pub fn params(&self) -> TransportParams {
        lock(&self.inner).params.clone()
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        lock(&self.inner).state
    }

    /// Number of times the engine asked this transport to connect.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        lock(&self.inner).connect_calls
    }

    /// Everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<ProtocolMessage> {
        lock(&self.inner).sent.clone()
    }

    /// Drain and return everything sent so far.
    pub fn take_sent(&self) -> Vec<ProtocolMessage> {
        std::mem::take(&mut lock(&self.inner).sent)
    }

    /// Report the transport as open.
    pub fn accept(&self) {
        let listener = {
            let mut inner = lock(&self.inner);
            inner.state = TransportState::Connected;
            inner.listener.clone()
        };
        listener.on_connected();
    }

    /// Deliver an inbound envelope.
    pub fn receive(&self, message: ProtocolMessage) {
        let listener = lock(&self.inner).listener.clone();
        listener.on_message_received(message);
    }

    /// Drop the connection from the remote side.
    pub fn disconnect(&self, error: Option<ErrorInfo>) {
        let listener = {
            let mut inner = lock(&self.inner);
            inner.state = TransportState::Closed;
            inner.listener.clone()
        };
        listener.on_disconnected(error);
    }
}

struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
    auto_accept: bool,
}

impl Transport for MemoryTransport {
    fn connect(&mut self) {
        let listener = {
            let mut inner = lock(&self.inner);
            inner.connect_calls += 1;
            inner.state = if self.auto_accept {
                TransportState::Connected
            } else {
                TransportState::Connecting
            };
            inner.listener.clone()
        };
        if self.auto_accept {
            listener.on_connected();
        }
    }

    fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.state != TransportState::Connected {
            return Err(TransportError::ConnectionClosed);
        }
        inner.sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.inner).state = TransportState::Closed;
    }

    fn state(&self) -> TransportState {
        lock(&self.inner).state
    }
}

/// Factory creating in-memory transports and keeping a handle to each.
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    created: Arc<Mutex<Vec<MemoryTransportHandle>>>,
    auto_accept: bool,
}

impl MemoryTransportFactory {
    /// Transports wait for [`MemoryTransportHandle::accept`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports report `on_connected` as soon as `connect` is called.
    #[must_use]
    pub fn auto_accept() -> Self {
        Self {
            created: Arc::default(),
            auto_accept: true,
        }
    }

    /// Number of transports created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The most recently created transport.
    #[must_use]
    pub fn last(&self) -> Option<MemoryTransportHandle> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Box<dyn Transport> {
        let inner = Arc::new(Mutex::new(Inner {
            params,
            listener,
            state: TransportState::Initialized,
            sent: Vec::new(),
            connect_calls: 0,
        }));
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MemoryTransportHandle {
                inner: inner.clone(),
            });
        Box::new(MemoryTransport {
            inner,
            auto_accept: self.auto_accept,
        })
    }
}
