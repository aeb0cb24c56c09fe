//! The reactor core: a single poll loop on a dedicated thread.
//!
//! The [`Dispatcher`] handle lives with its owning transport layer; the
//! [`Reactor`] lives on the dispatcher thread and exclusively owns the
//! selector, the registered event handlers, and the buffer pool. No other
//! thread ever touches those; all external mutation is marshaled onto the
//! dispatcher thread through a command channel and a selector wakeup, which
//! makes off-thread access structurally impossible rather than merely
//! asserted against.

use crate::buffer::BufferPool;
use crate::config::{get_namespaced_u64, get_namespaced_usize};
use crate::error::Error;
use crate::handler::{EventHandler, HandlerState, ReactorContext, RunOutcome};

use ::config::Config;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WAKE_TOKEN: Token = Token(0);
const HANDLER_TOKEN_START: usize = 1000;

const DEFAULT_BUFFER_CAPACITY: usize = 8192;
const DEFAULT_POLL_CAPACITY: usize = 1024;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

// Work injected into the reactor from other threads.
enum Command {
    Execute(Box<dyn FnOnce(&mut Reactor) + Send>),
    BeginClose { done: Sender<()> },
}

/// Completion handle for an asynchronous close.
///
/// Produced by `begin_close`; awaited by `end_close` from any thread.
pub struct CloseFuture {
    receiver: Receiver<()>,
}

impl CloseFuture {
    // A future that is already complete (nothing was running).
    fn ready() -> Self {
        let (sender, receiver) = channel();
        let _ = sender.send(());
        Self { receiver }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatcherState {
    Unopened,
    Open,
    Closing,
    Closed,
}

impl DispatcherState {
    fn name(self) -> &'static str {
        match self {
            DispatcherState::Unopened => "unopened",
            DispatcherState::Open => "open",
            DispatcherState::Closing => "closing",
            DispatcherState::Closed => "closed",
        }
    }
}

/// Owner-side handle to the reactor.
///
/// Created unopened; [`open`](Self::open) spawns the dedicated poll thread.
/// Once closed it cannot be reopened.
pub(crate) struct Dispatcher {
    state: DispatcherState,
    sender: Sender<Command>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    // Moved into the reactor when the poll thread starts.
    poll: Option<Poll>,
    receiver: Option<Receiver<Command>>,
    buffer_capacity: usize,
    poll_capacity: usize,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    /// Creates an unopened dispatcher with configuration namespacing.
    pub(crate) fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let buffer_capacity = get_namespaced_usize(config, name, "buffer_capacity")
            .unwrap_or(DEFAULT_BUFFER_CAPACITY);
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);
        let shutdown_timeout = Duration::from_millis(
            get_namespaced_u64(config, name, "handler_shutdown_timeout_ms")
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        );

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = channel();

        Ok(Self {
            state: DispatcherState::Unopened,
            sender,
            waker,
            thread: None,
            poll: Some(poll),
            receiver: Some(receiver),
            buffer_capacity,
            poll_capacity,
            shutdown_timeout,
        })
    }

    /// Spawns the dedicated poll thread. Callable once.
    pub(crate) fn open(&mut self) -> Result<(), Error> {
        if self.state != DispatcherState::Unopened {
            return Err(Error::illegal_state("open", self.state.name()));
        }

        let reactor = Reactor {
            poll: self.poll.take().expect("unopened dispatcher holds poll"),
            receiver: self
                .receiver
                .take()
                .expect("unopened dispatcher holds receiver"),
            handlers: HashMap::new(),
            registered_interests: HashMap::new(),
            pool: BufferPool::new(self.buffer_capacity),
            next_token: HANDLER_TOKEN_START,
            poll_capacity: self.poll_capacity,
            shutdown_timeout: self.shutdown_timeout,
        };
        let handle = thread::Builder::new()
            .name("tablewire-dispatcher".into())
            .spawn(move || reactor.run())?;
        self.thread = Some(handle);
        self.state = DispatcherState::Open;
        info!("Dispatcher opened");
        Ok(())
    }

    /// Bounds how long each handler is given to close itself during a
    /// dispatcher-wide close before being forced closed.
    pub(crate) fn set_event_handler_shutdown_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<(), Error> {
        match self.state {
            DispatcherState::Unopened => {
                self.shutdown_timeout = timeout;
                Ok(())
            }
            DispatcherState::Open => self.sync_exec(move |reactor| {
                reactor.shutdown_timeout = timeout;
                Ok(())
            }),
            _ => Err(Error::DispatcherClosed),
        }
    }

    /// Marshals `task` onto the dispatcher thread without waiting for it.
    pub(crate) fn exec<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        if self.state != DispatcherState::Open {
            return Err(Error::DispatcherClosed);
        }
        self.sender
            .send(Command::Execute(Box::new(task)))
            .map_err(|_| Error::DispatcherClosed)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Marshals `task` onto the dispatcher thread and blocks until it
    /// completes, returning its result or failure to the caller.
    ///
    /// Must not be called from the dispatcher thread itself; the task cannot
    /// run while its submitter is blocked inside it.
    pub(crate) fn sync_exec<T, F>(&self, task: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Reactor) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = channel();
        self.exec(move |reactor| {
            let _ = sender.send(task(reactor));
        })?;
        receiver.recv().map_err(|_| Error::DispatcherClosed)?
    }

    /// Signals the reactor to stop accepting new work and close every
    /// registered handler. Returns immediately; await via
    /// [`end_close`](Self::end_close).
    ///
    /// Safe to call from any thread, including the dispatcher thread itself
    /// (the request is a non-blocking channel send).
    pub(crate) fn begin_close(&mut self) -> CloseFuture {
        match self.state {
            DispatcherState::Unopened => {
                self.state = DispatcherState::Closed;
                CloseFuture::ready()
            }
            DispatcherState::Open => {
                self.state = DispatcherState::Closing;
                let (done, receiver) = channel();
                if self.sender.send(Command::BeginClose { done }).is_err() {
                    // Reactor already gone.
                    return CloseFuture::ready();
                }
                let _ = self.waker.wake();
                CloseFuture { receiver }
            }
            DispatcherState::Closing | DispatcherState::Closed => CloseFuture::ready(),
        }
    }

    /// Blocks until the close initiated by [`begin_close`](Self::begin_close)
    /// has completed and the poll thread has exited.
    pub(crate) fn end_close(&mut self, future: CloseFuture) -> Result<(), Error> {
        let completed = future.receiver.recv().map_err(|_| Error::DispatcherClosed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Dispatcher thread panicked");
                self.state = DispatcherState::Closed;
                return Err(Error::DispatcherClosed);
            }
        }
        self.state = DispatcherState::Closed;
        completed
    }
}

/// Reactor state owned by the dispatcher thread.
///
/// `sync_exec` tasks receive `&mut Reactor`, which is the only way code
/// outside this module ever reaches the handler table.
pub(crate) struct Reactor {
    poll: Poll,
    receiver: Receiver<Command>,
    handlers: HashMap<Token, Box<dyn EventHandler>>,
    registered_interests: HashMap<Token, Interest>,
    pool: BufferPool,
    next_token: usize,
    poll_capacity: usize,
    shutdown_timeout: Duration,
}

impl Reactor {
    /// Registers `handler`'s channel with the selector for its current
    /// interest set.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] if the handler's channel closed before
    /// registration; surfaced to the caller rather than swallowed, since
    /// this is an expected race. Other registration failures are returned
    /// as-is. Either way the handler is closed before returning, so its
    /// lifecycle callbacks still run.
    pub(crate) fn register_event_handler(
        &mut self,
        mut handler: Box<dyn EventHandler>,
    ) -> Result<Token, Error> {
        let token = self.allocate_token();
        let mut cx = ReactorContext {
            registry: self.poll.registry(),
            pool: &mut self.pool,
        };
        if let Err(err) = handler.register(token, &mut cx) {
            handler.close(None, &mut cx);
            return Err(err);
        }
        let interests = handler.interests();
        self.registered_interests.insert(token, interests);
        self.handlers.insert(token, handler);
        debug!(token = token.0, "Registered event handler");
        Ok(token)
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self
                .next_token
                .checked_add(1)
                .unwrap_or(HANDLER_TOKEN_START);
            if !self.handlers.contains_key(&token) {
                return token;
            }
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(self.poll_capacity);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "Poll failed; dispatcher stopping");
                return;
            }

            // Work injected by other threads arrives with a wakeup.
            let mut close_done = None;
            while let Ok(command) = self.receiver.try_recv() {
                match command {
                    Command::Execute(task) => task(&mut self),
                    Command::BeginClose { done } => close_done = Some(done),
                }
            }

            self.dispatch_ready_events(&events);
            self.resync_interests();
            self.sweep_closed();

            if let Some(done) = close_done {
                self.run_close_sequence(&mut events);
                let _ = done.send(());
                info!("Dispatcher closed");
                return;
            }
        }
    }

    fn dispatch_ready_events(&mut self, events: &Events) {
        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            self.dispatch_ready(token, readable, writable);
        }
    }

    fn dispatch_ready(&mut self, token: Token, readable: bool, writable: bool) {
        // The handler may have been closed earlier in this pass.
        let Some(handler) = self.handlers.get_mut(&token) else {
            return;
        };
        let mut cx = ReactorContext {
            registry: self.poll.registry(),
            pool: &mut self.pool,
        };
        let outcome = handler.ready(readable, writable, &mut cx);

        match outcome {
            RunOutcome::Continue => {}
            RunOutcome::Spawn(spawned) => {
                for handler in spawned {
                    if let Err(err) = self.register_event_handler(handler) {
                        warn!(?err, "Failed to register accepted connection");
                    }
                }
            }
            RunOutcome::Replace(successor) => {
                if let Err(err) = self.register_event_handler(successor) {
                    warn!(?err, "Failed to register established connection");
                }
            }
            RunOutcome::Close(error) => self.close_handler(token, error),
        }
    }

    // Re-synchronizes each open handler's interest set with the selector in
    // case running it changed what it wants.
    fn resync_interests(&mut self) {
        let tokens: Vec<Token> = self.handlers.keys().copied().collect();
        let mut failed = Vec::new();

        for token in tokens {
            let Some(handler) = self.handlers.get_mut(&token) else {
                continue;
            };
            if handler.state() != HandlerState::Open {
                continue;
            }
            let wanted = handler.interests();
            if self.registered_interests.get(&token) == Some(&wanted) {
                continue;
            }
            let mut cx = ReactorContext {
                registry: self.poll.registry(),
                pool: &mut self.pool,
            };
            match handler.reregister(token, &mut cx) {
                Ok(()) => {
                    self.registered_interests.insert(token, wanted);
                }
                Err(err) => {
                    warn!(token = token.0, ?err, "Failed to update interest set");
                    failed.push(token);
                }
            }
        }

        for token in failed {
            self.close_handler(token, None);
        }
    }

    fn sweep_closed(&mut self) {
        let closed: Vec<Token> = self
            .handlers
            .iter()
            .filter(|(_, handler)| handler.state() == HandlerState::Closed)
            .map(|(token, _)| *token)
            .collect();
        for token in closed {
            self.handlers.remove(&token);
            self.registered_interests.remove(&token);
        }
    }

    fn close_handler(&mut self, token: Token, error: Option<Error>) {
        if let Some(mut handler) = self.handlers.remove(&token) {
            let mut cx = ReactorContext {
                registry: self.poll.registry(),
                pool: &mut self.pool,
            };
            handler.close(error, &mut cx);
            self.registered_interests.remove(&token);
        }
    }

    // Orderly shutdown: ask every handler to close, keep the loop running so
    // pending output can flush, and force-close whatever is left when the
    // shutdown timeout expires.
    fn run_close_sequence(&mut self, events: &mut Events) {
        info!(handlers = self.handlers.len(), "Closing dispatcher");

        let tokens: Vec<Token> = self.handlers.keys().copied().collect();
        for token in tokens {
            let Some(handler) = self.handlers.get_mut(&token) else {
                continue;
            };
            let mut cx = ReactorContext {
                registry: self.poll.registry(),
                pool: &mut self.pool,
            };
            handler.request_close(&mut cx);
        }
        self.sweep_closed();

        let deadline = Instant::now() + self.shutdown_timeout;
        while !self.handlers.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Err(err) = self.poll.poll(events, Some(deadline - now)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                warn!(?err, "Poll failed during close");
                break;
            }
            self.dispatch_ready_events(events);
            self.resync_interests();
            self.sweep_closed();
        }

        let stragglers: Vec<Token> = self.handlers.keys().copied().collect();
        for token in stragglers {
            warn!(
                token = token.0,
                "Forcing event handler closed after shutdown timeout"
            );
            self.close_handler(token, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> Config {
        Config::builder().build().unwrap()
    }

    #[test]
    fn open_is_one_shot() {
        let mut dispatcher = Dispatcher::new_named(&empty_config(), "").unwrap();
        dispatcher.open().unwrap();
        assert!(matches!(dispatcher.open(), Err(Error::IllegalState { .. })));
        let future = dispatcher.begin_close();
        dispatcher.end_close(future).unwrap();
    }

    #[test]
    fn sync_exec_propagates_task_errors() {
        let mut dispatcher = Dispatcher::new_named(&empty_config(), "").unwrap();
        dispatcher.open().unwrap();

        let result: Result<(), Error> = dispatcher.sync_exec(|_reactor| Err(Error::InvalidAddress));
        assert!(matches!(result, Err(Error::InvalidAddress)));

        let value = dispatcher.sync_exec(|_reactor| Ok(17)).unwrap();
        assert_eq!(value, 17);

        let future = dispatcher.begin_close();
        dispatcher.end_close(future).unwrap();
    }

    #[test]
    fn sync_exec_after_close_is_rejected() {
        let mut dispatcher = Dispatcher::new_named(&empty_config(), "").unwrap();
        dispatcher.open().unwrap();
        let future = dispatcher.begin_close();
        dispatcher.end_close(future).unwrap();

        let result = dispatcher.sync_exec(|_reactor| Ok(()));
        assert!(matches!(result, Err(Error::DispatcherClosed)));
    }

    #[test]
    fn failed_registration_closes_the_handler() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct FailingHandler {
            closed: Arc<AtomicBool>,
        }

        impl EventHandler for FailingHandler {
            fn state(&self) -> HandlerState {
                HandlerState::Unregistered
            }

            fn interests(&self) -> Interest {
                Interest::READABLE
            }

            fn register(
                &mut self,
                _token: Token,
                _cx: &mut ReactorContext<'_>,
            ) -> Result<(), Error> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "selector rejected channel",
                )
                .into())
            }

            fn reregister(
                &mut self,
                _token: Token,
                _cx: &mut ReactorContext<'_>,
            ) -> Result<(), Error> {
                Ok(())
            }

            fn ready(
                &mut self,
                _readable: bool,
                _writable: bool,
                _cx: &mut ReactorContext<'_>,
            ) -> RunOutcome {
                RunOutcome::Continue
            }

            fn request_close(&mut self, _cx: &mut ReactorContext<'_>) -> bool {
                true
            }

            fn close(&mut self, _error: Option<Error>, _cx: &mut ReactorContext<'_>) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }

        let mut dispatcher = Dispatcher::new_named(&empty_config(), "").unwrap();
        dispatcher.open().unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let result = dispatcher.sync_exec(move |reactor| {
            reactor
                .register_event_handler(Box::new(FailingHandler { closed: flag }))
                .map(|_| ())
        });

        // The I/O cause reaches the caller uncollapsed, and the handler was
        // torn down so its lifecycle callbacks ran.
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(closed.load(Ordering::SeqCst));

        let future = dispatcher.begin_close();
        dispatcher.end_close(future).unwrap();
    }

    #[test]
    fn close_without_open_completes_trivially() {
        let mut dispatcher = Dispatcher::new_named(&empty_config(), "").unwrap();
        let future = dispatcher.begin_close();
        dispatcher.end_close(future).unwrap();
        assert!(matches!(dispatcher.open(), Err(Error::IllegalState { .. })));
    }

    #[test]
    fn shutdown_timeout_is_configurable() {
        let config = Config::builder()
            .set_default("handler_shutdown_timeout_ms", 250)
            .unwrap()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new_named(&config, "").unwrap();
        assert_eq!(dispatcher.shutdown_timeout, Duration::from_millis(250));

        let mut dispatcher = Dispatcher::new_named(&empty_config(), "").unwrap();
        dispatcher
            .set_event_handler_shutdown_timeout(Duration::from_millis(10))
            .unwrap();
        assert_eq!(dispatcher.shutdown_timeout, Duration::from_millis(10));
    }
}
