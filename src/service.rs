//! Interfaces between the transport layer and the application above it.
//!
//! The transport layer never interprets message bodies. When a connection is
//! established it asks the externally supplied [`TransportContext`] for a
//! [`Service`] instance, then feeds that service every decoded envelope and
//! notifies it when the connection goes away. Services talk back through the
//! [`ServiceContext`] handed into each callback.
//!
//! All callbacks run on the transport layer's dispatcher thread; they must
//! not block, and they must not call back into the blocking transport-layer
//! lifecycle methods (`end_open`, `end_close`, `sync_exec`).

use crate::envelope::MessageEnvelope;
use crate::error::Error;

/// Per-connection application-level handler that consumes decoded messages.
pub trait Service: Send {
    /// Invoked once when the connection is established and registered.
    fn started(&mut self, _context: &mut dyn ServiceContext) {}

    /// Invoked for every complete envelope decoded from the connection, in
    /// arrival order.
    fn message_received(&mut self, context: &mut dyn ServiceContext, envelope: MessageEnvelope);

    /// Invoked when the peer performed an orderly shutdown of its end.
    fn peer_stopped(&mut self, _context: &mut dyn ServiceContext) {}

    /// Invoked exactly once when the connection has closed, with the abnormal
    /// cause if there was one.
    fn stopped(&mut self, _error: Option<&Error>) {}
}

/// Capabilities a [`Service`] may use during a callback.
pub trait ServiceContext {
    /// Queues an envelope for transmission on this connection.
    ///
    /// Envelopes are flushed in the order enqueued.
    fn send_message(&mut self, envelope: MessageEnvelope);

    /// Requests an orderly close of this connection: queued output is flushed
    /// first, then the channel is closed.
    fn stop_service(&mut self);
}

/// Externally supplied context that binds a transport layer to its
/// application.
///
/// Supplies one [`Service`] per established connection and is notified when
/// connections go away. Implementations must be shareable across threads:
/// the factory is consulted on the dispatcher thread.
pub trait TransportContext: Send + Sync {
    /// Creates the service for a newly established connection.
    fn create_service(&self) -> Box<dyn Service>;

    /// Invoked when an established connection has been disconnected, with the
    /// abnormal cause if there was one.
    fn disconnected(&self, _error: Option<&Error>) {}
}
