//! Non-blocking event handlers driven by the dispatcher.
//!
//! Each handler owns one channel registered with the dispatcher's selector
//! and is invoked on the dispatcher thread when that channel is ready. The
//! closed set of handlers ([`Acceptor`], [`Connector`], [`ServiceHandler`])
//! shares the [`EventHandler`] capability interface; the dispatcher never
//! needs to know which concrete kind it is driving.
//!
//! Handlers never touch the dispatcher's registration table directly: state
//! transitions that affect it (new connections accepted, a connector turning
//! into a service handler, a handler closing itself) are returned as a
//! [`RunOutcome`] and applied by the dispatcher after `ready` returns.

mod acceptor;
mod connector;
mod service_handler;

pub(crate) use acceptor::Acceptor;
pub(crate) use connector::Connector;
pub(crate) use service_handler::ServiceHandler;

use crate::buffer::BufferPool;
use crate::error::Error;

use mio::{Interest, Registry, Token};

/// Lifecycle of an event handler. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerState {
    /// Created but not yet registered with the dispatcher.
    Unregistered,
    /// Registered and live.
    Open,
    /// Torn down; the channel is gone.
    Closed,
}

impl HandlerState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            HandlerState::Unregistered => "unregistered",
            HandlerState::Open => "open",
            HandlerState::Closed => "closed",
        }
    }
}

/// Reactor-owned resources a handler may use while running.
///
/// Only ever constructed on the dispatcher thread; handing it into every
/// handler entry point is what makes off-thread handler access structurally
/// impossible.
pub(crate) struct ReactorContext<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) pool: &'a mut BufferPool,
}

/// What the dispatcher should do after a handler ran.
pub(crate) enum RunOutcome {
    /// Nothing to apply; interests are re-synced as usual.
    Continue,
    /// Register these newly created handlers (accepted connections).
    Spawn(Vec<Box<dyn EventHandler>>),
    /// The handler is done and hands its channel over to a successor
    /// (connector promoting itself to a service handler).
    Replace(Box<dyn EventHandler>),
    /// Close this handler, recording the abnormal cause if any.
    Close(Option<Error>),
}

/// One non-blocking channel registered with the dispatcher.
///
/// Every method is invoked on the dispatcher thread only.
pub(crate) trait EventHandler: Send {
    fn state(&self) -> HandlerState;

    /// The interest set this handler currently wants from the selector.
    ///
    /// Re-queried after every `ready` invocation; the dispatcher re-registers
    /// the channel whenever the answer changes.
    fn interests(&self) -> Interest;

    /// Registers the handler's channel with the selector under `token`.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] if the channel was closed before
    /// registration, an expected race surfaced to the caller rather than
    /// swallowed. Selector failures are returned as the underlying I/O
    /// error.
    fn register(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error>;

    /// Re-registers the channel with the handler's current interests.
    fn reregister(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error>;

    /// Invoked when the channel is ready. Must not block.
    fn ready(&mut self, readable: bool, writable: bool, cx: &mut ReactorContext<'_>) -> RunOutcome;

    /// Asks the handler to close gracefully (flush pending output first).
    ///
    /// Returns `true` if the handler closed immediately.
    fn request_close(&mut self, cx: &mut ReactorContext<'_>) -> bool;

    /// Tears the handler down: closes the channel, transitions to `Closed`.
    ///
    /// Idempotent; `error` records the abnormal cause when present.
    fn close(&mut self, error: Option<Error>, cx: &mut ReactorContext<'_>);
}
