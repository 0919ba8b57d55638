//! # ripple-transport
//!
//! Transport collaborator interface for the Ripple realtime client.
//!
//! The engine never touches sockets directly; it owns a [`Transport`] and
//! listens to it through a [`TransportListener`]. This crate provides:
//!
//! - **traits** - `Transport`, `TransportFactory`, `TransportListener`, and the
//!   async `Socket`/`Connector` pair concrete transports are built from
//! - **driver** - runs a `Connector` as a `Transport` on a background task
//! - **WebSocket** - the standard connector
//! - **fallback** - fallback host selection
//! - **memory** - an in-memory transport for tests and benchmarks
//!
//! ```rust,ignore
//! use ripple_transport::{WebSocketConnector, TransportFactory};
//!
//! let factory = WebSocketConnector::default().into_factory();
//! let transport = factory.create(params, listener);
//! ```

pub mod driver;
pub mod fallback;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use driver::{SocketTransport, SocketTransportFactory};
pub use fallback::FallbackHosts;
pub use memory::{MemoryTransportFactory, MemoryTransportHandle};
pub use traits::{
    Connector, Socket, Transport, TransportError, TransportFactory, TransportListener,
    TransportParams, TransportState,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
