//! Established-connection event handler.

use super::{EventHandler, HandlerState, ReactorContext, RunOutcome};
use crate::buffer::BufferPool;
use crate::envelope::MessageEnvelope;
use crate::error::Error;
use crate::queue::{InputQueue, OutputQueue};
use crate::service::{Service, ServiceContext, TransportContext};

use mio::net::TcpStream;
use mio::{Interest, Token};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, trace, warn};

// ServiceContext implementation handed into service callbacks. Borrows the
// handler's disjoint fields so the service can enqueue output while the
// handler still owns its input side.
struct HandlerServiceContext<'a> {
    output: &'a mut OutputQueue,
    pool: &'a mut BufferPool,
    stop_requested: &'a mut bool,
}

impl ServiceContext for HandlerServiceContext<'_> {
    fn send_message(&mut self, envelope: MessageEnvelope) {
        self.output.enqueue(&envelope, self.pool);
    }

    fn stop_service(&mut self) {
        *self.stop_requested = true;
    }
}

/// Drives one established connection: reads bytes into the input queue,
/// dispatches decoded envelopes to the service, and drains the output queue
/// on writability.
pub(crate) struct ServiceHandler {
    stream: Option<TcpStream>,
    state: HandlerState,
    opened: bool,
    token: Option<Token>,
    peer_addr: Option<SocketAddr>,
    service: Box<dyn Service>,
    context: Arc<dyn TransportContext>,
    input: InputQueue,
    output: OutputQueue,
    stop_requested: bool,
    /// Graceful close in progress: flush remaining output, then close.
    draining: bool,
}

impl ServiceHandler {
    pub(crate) fn new(service: Box<dyn Service>, context: Arc<dyn TransportContext>) -> Self {
        Self {
            stream: None,
            state: HandlerState::Unregistered,
            opened: false,
            token: None,
            peer_addr: None,
            service,
            context,
            input: InputQueue::new(),
            output: OutputQueue::new(),
            stop_requested: false,
            draining: false,
        }
    }

    /// Adopts an established channel. May be called exactly once; reopening
    /// or opening after close is an illegal-state error.
    pub(crate) fn open(&mut self, stream: TcpStream) -> Result<(), Error> {
        if self.state == HandlerState::Closed {
            return Err(Error::illegal_state("open", "closed"));
        }
        if self.opened {
            return Err(Error::illegal_state("open", "already open"));
        }
        self.opened = true;
        self.peer_addr = stream.peer_addr().ok();
        self.stream = Some(stream);
        Ok(())
    }

    fn handle_readable(&mut self, cx: &mut ReactorContext<'_>) -> Result<bool, Error> {
        let stream = self.stream.as_mut().expect("open handler has stream");
        let status = self.input.fill_from(stream, cx.pool)?;
        trace!(bytes = status.bytes_read, "Filled input queue");

        // Dispatch every complete envelope that is now buffered, in order.
        while let Some(envelope) = self.input.dequeue_message_envelope(cx.pool)? {
            let mut service_cx = HandlerServiceContext {
                output: &mut self.output,
                pool: cx.pool,
                stop_requested: &mut self.stop_requested,
            };
            self.service.message_received(&mut service_cx, envelope);
        }

        if status.end_of_stream {
            let peer_addr = self.peer_addr;
            info!(?peer_addr, "Peer closed connection");
            let mut service_cx = HandlerServiceContext {
                output: &mut self.output,
                pool: cx.pool,
                stop_requested: &mut self.stop_requested,
            };
            self.service.peer_stopped(&mut service_cx);
        }
        Ok(status.end_of_stream)
    }

    fn handle_writable(&mut self, cx: &mut ReactorContext<'_>) -> Result<(), Error> {
        let stream = self.stream.as_mut().expect("open handler has stream");
        self.output.drain_to(stream, cx.pool)?;
        Ok(())
    }
}

impl EventHandler for ServiceHandler {
    fn state(&self) -> HandlerState {
        self.state
    }

    fn interests(&self) -> Interest {
        if self.draining {
            Interest::WRITABLE
        } else if self.output.has_pending() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn register(&mut self, token: Token, cx: &mut ReactorContext<'_>) -> Result<(), Error> {
        if self.state != HandlerState::Unregistered {
            return Err(Error::illegal_state("register", self.state.name()));
        }
        if self.stream.is_none() {
            return Err(Error::ChannelClosed);
        }

        // Let the service queue its greeting before the interest set is
        // computed, so the first registration already asks for writability.
        let mut service_cx = HandlerServiceContext {
            output: &mut self.output,
            pool: cx.pool,
            stop_requested: &mut self.stop_requested,
        };
        self.service.started(&mut service_cx);

        let interests = self.interests();
        let stream = self.stream.as_mut().expect("checked above");
        cx.registry.register(stream, token, interests)?;
        self.token = Some(token);
        self.state = HandlerState::Open;

        if self.stop_requested && !self.output.has_pending() {
            self.close(None, cx);
        }
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

    fn ready(&mut self, readable: bool, writable: bool, cx: &mut ReactorContext<'_>) -> RunOutcome {
        if self.state != HandlerState::Open {
            return RunOutcome::Continue;
        }

        if writable {
            if let Err(err) = self.handle_writable(cx) {
                return RunOutcome::Close(Some(err));
            }
            if self.draining && !self.output.has_pending() {
                return RunOutcome::Close(None);
            }
        }

        if readable && !self.draining {
            match self.handle_readable(cx) {
                Ok(true) => {
                    // Replies enqueued for the peer's final envelopes still
                    // get flushed before the channel goes down.
                    if self.output.has_pending() {
                        self.draining = true;
                    } else {
                        return RunOutcome::Close(None);
                    }
                }
                Ok(false) => {}
                Err(err) => return RunOutcome::Close(Some(err)),
            }
        }

        if self.stop_requested {
            if self.output.has_pending() {
                self.draining = true;
            } else {
                return RunOutcome::Close(None);
            }
        }

        RunOutcome::Continue
    }

    fn request_close(&mut self, cx: &mut ReactorContext<'_>) -> bool {
        if self.state == HandlerState::Closed {
            return true;
        }
        if self.output.has_pending() {
            self.draining = true;
            if let Some(token) = self.token {
                if let Err(err) = self.reregister(token, cx) {
                    warn!(?err, "Failed to reregister draining connection");
                    self.close(None, cx);
                    return true;
                }
            }
            false
        } else {
            self.close(None, cx);
            true
        }
    }

    fn close(&mut self, error: Option<Error>, cx: &mut ReactorContext<'_>) {
        if self.state == HandlerState::Closed {
            return;
        }
        self.state = HandlerState::Closed;
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = cx.registry.deregister(&mut stream) {
                warn!(?err, "Failed to deregister connection");
            }
        }
        self.input.discard(cx.pool);
        self.output.discard(cx.pool);

        let peer_addr = self.peer_addr;
        match &error {
            Some(err) => warn!(?peer_addr, ?err, "Closed connection after error"),
            None => info!(?peer_addr, "Closed connection"),
        }
        self.service.stopped(error.as_ref());
        self.context.disconnected(error.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullService;

    impl Service for NullService {
        fn message_received(
            &mut self,
            _context: &mut dyn ServiceContext,
            _envelope: MessageEnvelope,
        ) {
        }
    }

    struct NullContext;

    impl TransportContext for NullContext {
        fn create_service(&self) -> Box<dyn Service> {
            Box::new(NullService)
        }
    }

    fn new_handler() -> ServiceHandler {
        ServiceHandler::new(Box::new(NullService), Arc::new(NullContext))
    }

    fn connected_stream() -> TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        TcpStream::from_std(stream)
    }

    #[test]
    fn open_is_one_shot() {
        let mut handler = new_handler();
        handler.open(connected_stream()).unwrap();
        assert!(matches!(
            handler.open(connected_stream()),
            Err(Error::IllegalState { .. })
        ));
    }

    #[test]
    fn open_after_close_is_illegal() {
        let poll = mio::Poll::new().unwrap();
        let mut pool = BufferPool::new(16);
        let mut cx = ReactorContext {
            registry: poll.registry(),
            pool: &mut pool,
        };

        let mut handler = new_handler();
        handler.open(connected_stream()).unwrap();
        handler.close(None, &mut cx);
        handler.close(None, &mut cx); // idempotent
        assert_eq!(handler.state(), HandlerState::Closed);
        assert!(matches!(
            handler.open(connected_stream()),
            Err(Error::IllegalState { .. })
        ));
    }

    #[test]
    fn registering_without_channel_raises_channel_closed() {
        let poll = mio::Poll::new().unwrap();
        let mut pool = BufferPool::new(16);
        let mut cx = ReactorContext {
            registry: poll.registry(),
            pool: &mut pool,
        };

        // Never opened: the channel is absent, which is indistinguishable
        // from a channel that closed before registration.
        let mut handler = new_handler();
        assert!(matches!(
            handler.register(Token(7), &mut cx),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn eof_with_pending_reply_drains_before_close() {
        use std::io::{Read, Write};
        use std::time::{Duration, Instant};

        struct EchoOnce;

        impl Service for EchoOnce {
            fn message_received(
                &mut self,
                context: &mut dyn ServiceContext,
                envelope: MessageEnvelope,
            ) {
                let reply =
                    MessageEnvelope::new(envelope.id(), envelope.id(), envelope.into_body());
                context.send_message(reply);
            }
        }

        let poll = mio::Poll::new().unwrap();
        let mut pool = BufferPool::new(64);
        let mut cx = ReactorContext {
            registry: poll.registry(),
            pool: &mut pool,
        };

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let mut handler = ServiceHandler::new(Box::new(EchoOnce), Arc::new(NullContext));
        handler.open(TcpStream::from_std(accepted)).unwrap();
        handler.register(Token(21), &mut cx).unwrap();

        let request = MessageEnvelope::new(3, 0, b"last words".to_vec());
        peer.write_all(&request.encode()).unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        // The reply to the peer's final envelope must survive the EOF: the
        // handler switches to draining instead of closing outright.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handler.draining {
            match handler.ready(true, false, &mut cx) {
                RunOutcome::Continue => {}
                RunOutcome::Close(_) => panic!("closed with a reply still queued"),
                _ => panic!("unexpected outcome"),
            }
            assert!(Instant::now() < deadline, "timed out waiting for EOF");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(handler.output.has_pending());
        assert_eq!(handler.interests(), Interest::WRITABLE);

        // Writability flushes the reply, then the handler closes normally.
        assert!(matches!(
            handler.ready(false, true, &mut cx),
            RunOutcome::Close(None)
        ));

        let mut echoed = vec![0u8; request.total_length()];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, request.encode());
    }

    #[test]
    fn close_without_register_notifies_service() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct RecordingService {
            stopped: Arc<AtomicBool>,
        }

        impl Service for RecordingService {
            fn message_received(
                &mut self,
                _context: &mut dyn ServiceContext,
                _envelope: MessageEnvelope,
            ) {
            }

            fn stopped(&mut self, _error: Option<&Error>) {
                self.stopped.store(true, Ordering::SeqCst);
            }
        }

        let poll = mio::Poll::new().unwrap();
        let mut pool = BufferPool::new(16);
        let mut cx = ReactorContext {
            registry: poll.registry(),
            pool: &mut pool,
        };

        // A handler whose registration never completed is still torn down
        // through close, so the service observes its stop.
        let stopped = Arc::new(AtomicBool::new(false));
        let service = RecordingService {
            stopped: Arc::clone(&stopped),
        };
        let mut handler = ServiceHandler::new(Box::new(service), Arc::new(NullContext));
        handler.open(connected_stream()).unwrap();
        handler.close(None, &mut cx);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn interests_follow_pending_output() {
        let mut pool = BufferPool::new(16);
        let mut handler = new_handler();
        assert_eq!(handler.interests(), Interest::READABLE);

        handler
            .output
            .enqueue(&MessageEnvelope::new(1, 0, vec![1, 2, 3]), &mut pool);
        assert_eq!(
            handler.interests(),
            Interest::READABLE | Interest::WRITABLE
        );
    }
}
