//! Active outbound-connect event handler.

use super::{EventHandler, HandlerState, ReactorContext, RunOutcome, ServiceHandler};
use crate::error::Error;
use crate::service::TransportContext;

use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Wraps a socket in connect mode; on connect completion it resolves the
/// pending open promise and hands the channel over to a freshly constructed
/// [`ServiceHandler`].
pub(crate) struct Connector {
    stream: Option<TcpStream>,
    state: HandlerState,
    connect_called: bool,
    peer_addr: Option<SocketAddr>,
    context: Arc<dyn TransportContext>,
    /// Resolved exactly once, with the connect outcome.
    promise: Option<Sender<Result<SocketAddr, Error>>>,
}

impl Connector {
    pub(crate) fn new(
        context: Arc<dyn TransportContext>,
        promise: Sender<Result<SocketAddr, Error>>,
    ) -> Self {
        Self {
            stream: None,
            state: HandlerState::Unregistered,
            connect_called: false,
            peer_addr: None,
            context,
            promise: Some(promise),
        }
    }

    /// Initiates the non-blocking connect. May be called exactly once; a
    /// second call, or a call after close, is an illegal-state error.
    #[instrument(skip(self))]
    pub(crate) fn connect(&mut self, addr: SocketAddr) -> Result<(), Error> {
        if self.state == HandlerState::Closed {
            return Err(Error::illegal_state("connect", "closed"));
        }
        if self.connect_called {
            return Err(Error::illegal_state("connect", "already connecting"));
        }
        self.connect_called = true;

        let stream = TcpStream::connect(addr)?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%addr, ?err, "Failed to set TCP_NODELAY on outbound connection");
        }
        info!(peer_addr = %addr, "Initiating connection");
        self.peer_addr = Some(addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn resolve(&mut self, result: Result<SocketAddr, Error>) {
        if let Some(promise) = self.promise.take() {
            // The opener may have stopped waiting; that is not an error here.
            let _ = promise.send(result);
        }
    }
}

impl EventHandler for Connector {
    fn state(&self) -> HandlerState {
        self.state
    }

    fn interests(&self) -> Interest {
        Interest::WRITABLE
    }

    fn register(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error> {
        if self.state != HandlerState::Unregistered {
            return Err(Error::illegal_state("register", self.state.name()));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        cx.registry.register(stream, token, Interest::WRITABLE)?;
        self.state = HandlerState::Open;
        Ok(())
    }

    fn reregister(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error> {
        let interests = self.interests();
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        cx.registry.reregister(stream, token, interests)?;
        Ok(())
    }

    fn ready(
        &mut self,
        _readable: bool,
        writable: bool,
        cx: &mut ReactorContext<'_>,
    ) -> RunOutcome {
        if !writable || self.state != HandlerState::Open {
            return RunOutcome::Continue;
        }

        let stream = self.stream.as_mut().expect("open connector has stream");
        let connect_error = match stream.take_error() {
            Ok(None) => None,
            Ok(Some(err)) => Some(err),
            Err(err) => Some(err),
        };

        match connect_error {
            None => {
                let peer_addr = self.peer_addr.expect("connect recorded the address");
                info!(%peer_addr, "Connection established");

                // Hand the channel over to a service handler; this connector
                // is done.
                let mut stream = self.stream.take().expect("checked above");
                if let Err(err) = cx.registry.deregister(&mut stream) {
                    warn!(?err, "Failed to deregister connector");
                }
                self.state = HandlerState::Closed;

                let service = self.context.create_service();
                let mut handler = ServiceHandler::new(service, Arc::clone(&self.context));
                match handler.open(stream) {
                    Ok(()) => {
                        self.resolve(Ok(peer_addr));
                        RunOutcome::Replace(Box::new(handler))
                    }
                    Err(err) => {
                        self.resolve(Err(err));
                        RunOutcome::Continue
                    }
                }
            }
            Some(err) => {
                let peer_addr = self.peer_addr;
                if err.kind() == ErrorKind::ConnectionRefused {
                    info!(?peer_addr, "Connection refused");
                } else {
                    warn!(?peer_addr, ?err, "Connection establishment failed");
                }
                self.resolve(Err(err.into()));
                RunOutcome::Close(None)
            }
        }
    }

    fn request_close(&mut self, cx: &mut ReactorContext<'_>) -> bool {
        self.close(None, cx);
        true
    }

    fn close(&mut self, error: Option<Error>, cx: &mut ReactorContext<'_>) {
        if self.state == HandlerState::Closed {
            return;
        }
        self.state = HandlerState::Closed;
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = cx.registry.deregister(&mut stream) {
                warn!(?err, "Failed to deregister connector");
            }
        }
        // An opener still waiting learns the attempt was abandoned.
        self.resolve(Err(error.unwrap_or(Error::ChannelClosed)));
        info!(peer_addr = ?self.peer_addr, "Closed connector");
    }
}
