//! tablewire - A peer-to-peer message transport for networked tabletop games
//!
//! tablewire moves length-prefixed message envelopes between two peers over
//! TCP. Each endpoint runs one transport layer: a single dispatcher thread
//! drives every connection with non-blocking I/O, decodes complete envelopes
//! from the byte stream, and delivers them to an application-supplied
//! [`Service`]. The same code serves both sides; configuration decides
//! whether an endpoint listens ([`TransportRole::Passive`]) or connects
//! ([`TransportRole::Active`]).
//!
//! Opening and closing are split-phase: `begin_open`/`begin_close` start the
//! operation and return a future, `end_open`/`end_close` block on it. All
//! service callbacks run on the dispatcher thread and must not block.

// Internal-only modules
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod dispatcher;
pub(crate) mod envelope;
pub(crate) mod error;
pub(crate) mod handler;
pub(crate) mod queue;
pub(crate) mod service;
pub(crate) mod transport;

// These are the intended public API
pub use dispatcher::CloseFuture;
pub use envelope::{MessageEnvelope, NO_CORRELATION_ID};
pub use error::Error;
pub use service::{Service, ServiceContext, TransportContext};
pub use transport::{OpenFuture, TransportLayer, TransportLayerFactory, TransportRole};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::envelope::MessageEnvelope;
    pub use crate::error::Error;
    pub use crate::service::{Service, ServiceContext, TransportContext};
    pub use crate::transport::{TransportLayer, TransportLayerFactory, TransportRole};
}
