//! Passive listen/accept event handler.

use super::{EventHandler, HandlerState, ReactorContext, RunOutcome, ServiceHandler};
use crate::error::Error;
use crate::service::TransportContext;

use mio::net::TcpListener;
use mio::{Interest, Token};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Wraps a listening socket; accepts incoming connections and spawns a
/// [`ServiceHandler`] for each.
pub(crate) struct Acceptor {
    listener: Option<TcpListener>,
    state: HandlerState,
    bound: bool,
    context: Arc<dyn TransportContext>,
}

impl Acceptor {
    pub(crate) fn new(context: Arc<dyn TransportContext>) -> Self {
        Self {
            listener: None,
            state: HandlerState::Unregistered,
            bound: false,
            context,
        }
    }

    /// Binds the listening socket. May be called exactly once; a second call,
    /// or a call after close, is an illegal-state error.
    #[instrument(skip(self))]
    pub(crate) fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        if self.state == HandlerState::Closed {
            return Err(Error::illegal_state("bind", "closed"));
        }
        if self.bound {
            return Err(Error::illegal_state("bind", "already bound"));
        }
        self.bound = true;

        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening for connections");
        self.listener = Some(listener);
        Ok(local_addr)
    }

    fn accept_pending(&mut self) -> Result<Vec<Box<dyn EventHandler>>, Error> {
        let listener = self.listener.as_mut().expect("open acceptor has listener");
        let mut spawned: Vec<Box<dyn EventHandler>> = Vec::new();

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(%peer_addr, ?err, "Failed to set TCP_NODELAY on accepted connection");
                    }
                    info!(%peer_addr, "Accepting connection");
                    let service = self.context.create_service();
                    let mut handler = ServiceHandler::new(service, Arc::clone(&self.context));
                    handler.open(stream)?;
                    spawned.push(Box::new(handler));
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        // The peer gave up between readiness and accept.
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting connection");
                        return Err(err.into());
                    }
                },
            }
        }

        Ok(spawned)
    }
}

impl EventHandler for Acceptor {
    fn state(&self) -> HandlerState {
        self.state
    }

    fn interests(&self) -> Interest {
        Interest::READABLE
    }

    fn register(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error> {
        if self.state != HandlerState::Unregistered {
            return Err(Error::illegal_state("register", self.state.name()));
        }
        let Some(listener) = self.listener.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        cx.registry.register(listener, token, Interest::READABLE)?;
        self.state = HandlerState::Open;
        Ok(())
    }

    fn reregister(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error> {
        let interests = self.interests();
        let Some(listener) = self.listener.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        cx.registry.reregister(listener, token, interests)?;
        Ok(())
    }

    fn ready(
        &mut self,
        readable: bool,
        _writable: bool,
        _cx: &mut ReactorContext<'_>,
    ) -> RunOutcome {
        if !readable || self.state != HandlerState::Open {
            return RunOutcome::Continue;
        }
        match self.accept_pending() {
            Ok(spawned) if spawned.is_empty() => RunOutcome::Continue,
            Ok(spawned) => RunOutcome::Spawn(spawned),
            Err(err) => RunOutcome::Close(Some(err)),
        }
    }

    fn request_close(&mut self, cx: &mut ReactorContext<'_>) -> bool {
        // Nothing to flush; stop accepting immediately.
        self.close(None, cx);
        true
    }

    fn close(&mut self, error: Option<Error>, cx: &mut ReactorContext<'_>) {
        if self.state == HandlerState::Closed {
            return;
        }
        self.state = HandlerState::Closed;
        if let Some(mut listener) = self.listener.take() {
            if let Err(err) = cx.registry.deregister(&mut listener) {
                warn!(?err, "Failed to deregister listener");
            }
        }
        match error {
            Some(err) => warn!(?err, "Closed acceptor after error"),
            None => info!("Closed acceptor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::service::Service;

    struct NullContext;

    impl TransportContext for NullContext {
        fn create_service(&self) -> Box<dyn Service> {
            unreachable!("no connections in this test")
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn bind_is_one_shot() {
        let mut acceptor = Acceptor::new(Arc::new(NullContext));
        acceptor.bind(loopback()).unwrap();
        assert!(matches!(
            acceptor.bind(loopback()),
            Err(Error::IllegalState { .. })
        ));
    }

    #[test]
    fn bind_after_close_is_illegal() {
        let poll = mio::Poll::new().unwrap();
        let mut pool = BufferPool::new(16);
        let mut cx = ReactorContext {
            registry: poll.registry(),
            pool: &mut pool,
        };

        let mut acceptor = Acceptor::new(Arc::new(NullContext));
        acceptor.close(None, &mut cx);
        acceptor.close(None, &mut cx); // idempotent
        assert_eq!(acceptor.state(), HandlerState::Closed);
        assert!(matches!(
            acceptor.bind(loopback()),
            Err(Error::IllegalState { .. })
        ));
    }

    #[test]
    fn register_without_channel_is_channel_closed() {
        let poll = mio::Poll::new().unwrap();
        let mut pool = BufferPool::new(16);
        let mut cx = ReactorContext {
            registry: poll.registry(),
            pool: &mut pool,
        };

        let mut acceptor = Acceptor::new(Arc::new(NullContext));
        assert!(matches!(
            acceptor.register(Token(1), &mut cx),
            Err(Error::ChannelClosed)
        ));
    }
}
