use thiserror::Error;

/// The error type for tablewire operations.
///
/// This encompasses all errors that can occur when using the transport layer,
/// including network operations, message framing, and lifecycle violations.
///
/// Per-connection failures (connection reset, peer disconnect) are handled
/// internally by closing the affected connection and notifying its service;
/// they only appear here when a caller explicitly awaits an operation that
/// failed, such as `end_open` on a refused connection.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Attempted to register an event handler whose channel was already
    /// closed.
    ///
    /// This is an expected race (the peer can close at any time), surfaced as
    /// a distinct error so callers can tell it apart from logic bugs.
    #[error("Channel closed before registration")]
    ChannelClosed,

    // ============================================================================
    // Lifecycle Errors
    // ============================================================================

    /// A one-shot operation was invoked a second time, or after close.
    ///
    /// Raised by `Acceptor::bind`, `Connector::connect`,
    /// `ServiceHandler::open`, `Dispatcher::open`, and the transport layer's
    /// `begin_open`/`begin_close`. These are contract violations, never
    /// retried.
    #[error("Illegal state for {operation}: {state}")]
    IllegalState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the component was in.
        state: &'static str,
    },

    /// The dispatcher's poll thread has stopped or is shutting down.
    ///
    /// Returned when `sync_exec` or an open/close future can no longer reach
    /// the reactor.
    #[error("Dispatcher closed")]
    DispatcherClosed,

    // ============================================================================
    // Framing Errors
    // ============================================================================

    /// A message envelope header declared a body length above the supported
    /// maximum.
    ///
    /// This typically indicates corrupted data or a peer speaking a different
    /// protocol; the connection carrying it is closed.
    #[error("Envelope body length {length} exceeds maximum {max}")]
    EnvelopeTooLarge { length: usize, max: usize },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `transport_role` configuration key.
    ///
    /// Must be one of: "active" or "passive".
    #[error("Invalid transport role '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportRole { got: String, valid: Vec<String> },
}

impl Error {
    pub(crate) fn illegal_state(operation: &'static str, state: &'static str) -> Self {
        Error::IllegalState { operation, state }
    }
}
