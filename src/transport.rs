//! The transport layer façade.
//!
//! A [`TransportLayer`] owns one dispatcher and presents the asynchronous
//! open/close lifecycle to the application: `begin_open` starts listening or
//! connecting according to the configured [`TransportRole`] and returns an
//! [`OpenFuture`]; `end_open` blocks until the layer is usable. Closing is
//! split the same way so a caller can stop several layers concurrently and
//! then await them all.

use crate::config::get_namespaced_string;
use crate::dispatcher::{CloseFuture, Dispatcher};
use crate::error::Error;
use crate::handler::{Acceptor, Connector};
use crate::service::TransportContext;

use ::config::Config;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Which side of the connection this layer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// Initiates an outbound connection on open.
    Active,
    /// Binds a listening socket on open and accepts inbound connections.
    Passive,
}

impl TransportRole {
    /// Reads the `transport_role` key, honoring configuration namespacing.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        get_namespaced_string(config, name, "transport_role")?.parse()
    }
}

impl FromStr for TransportRole {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Error> {
        match value {
            "active" => Ok(TransportRole::Active),
            "passive" => Ok(TransportRole::Passive),
            other => Err(Error::InvalidTransportRole {
                got: other.to_string(),
                valid: vec!["active".to_string(), "passive".to_string()],
            }),
        }
    }
}

/// Completion handle for an asynchronous open.
///
/// Resolves to the layer's significant address: the bound listening address
/// for a passive layer, the connected peer address for an active one.
pub struct OpenFuture {
    receiver: Receiver<Result<SocketAddr, Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerState {
    Unopened,
    Open,
    Closing,
    Closed,
}

impl LayerState {
    fn name(self) -> &'static str {
        match self {
            LayerState::Unopened => "unopened",
            LayerState::Open => "open",
            LayerState::Closing => "closing",
            LayerState::Closed => "closed",
        }
    }
}

/// Creates transport layers from configuration.
pub struct TransportLayerFactory;

impl TransportLayerFactory {
    /// Creates a layer using un-namespaced configuration keys.
    pub fn create_transport_layer(
        config: &Config,
        context: Arc<dyn TransportContext>,
    ) -> Result<TransportLayer, Error> {
        Self::create_named(config, "", context)
    }

    /// Creates a layer whose configuration keys are looked up under `name`
    /// first (`{name}.{key}`), falling back to the bare key. Lets one
    /// configuration source hold settings for several layers.
    pub fn create_named(
        config: &Config,
        name: &str,
        context: Arc<dyn TransportContext>,
    ) -> Result<TransportLayer, Error> {
        let role = TransportRole::from_config(config, name)?;
        let dispatcher = Dispatcher::new_named(config, name)?;
        Ok(TransportLayer {
            role,
            context,
            dispatcher,
            state: LayerState::Unopened,
        })
    }
}

/// One endpoint of the transport: a dispatcher plus the active or passive
/// opening strategy.
///
/// Lifecycle methods (`begin_open`, `end_open`, `begin_close`, `end_close`,
/// [`sync_exec`](Self::sync_exec)) must be called from application threads,
/// never from service callbacks: those run on the dispatcher thread, and
/// blocking there deadlocks the layer. A service that wants its layer closed
/// signals its own application code instead.
pub struct TransportLayer {
    role: TransportRole,
    context: Arc<dyn TransportContext>,
    dispatcher: Dispatcher,
    state: LayerState,
}

impl TransportLayer {
    pub fn role(&self) -> TransportRole {
        self.role
    }

    /// Starts opening the layer and returns immediately.
    ///
    /// Passive: binds a listener on `host:port` and begins accepting.
    /// Active: initiates a non-blocking connect to `host:port`.
    ///
    /// Failures after this point (bind refused, connection refused) surface
    /// through [`end_open`](Self::end_open), not here. May be called exactly
    /// once.
    #[instrument(skip(self))]
    pub fn begin_open(&mut self, host: &str, port: u16) -> Result<OpenFuture, Error> {
        if self.state != LayerState::Unopened {
            return Err(Error::illegal_state("begin_open", self.state.name()));
        }

        let addr = resolve(host, port)?;
        self.dispatcher.open()?;
        self.state = LayerState::Open;
        info!(%addr, role = ?self.role, "Opening transport layer");

        let (sender, receiver) = channel();
        match self.role {
            TransportRole::Passive => {
                let context = Arc::clone(&self.context);
                self.dispatcher.exec(move |reactor| {
                    let result = (|| {
                        let mut acceptor = Acceptor::new(context);
                        let local_addr = acceptor.bind(addr)?;
                        reactor.register_event_handler(Box::new(acceptor))?;
                        Ok(local_addr)
                    })();
                    let _ = sender.send(result);
                })?;
            }
            TransportRole::Active => {
                let context = Arc::clone(&self.context);
                // The connector resolves the promise itself once the connect
                // completes; this path only reports setup failures.
                let promise = sender.clone();
                self.dispatcher.exec(move |reactor| {
                    let result = (|| {
                        let mut connector = Connector::new(context, promise);
                        connector.connect(addr)?;
                        reactor.register_event_handler(Box::new(connector))?;
                        Ok(())
                    })();
                    if let Err(err) = result {
                        let _ = sender.send(Err(err));
                    }
                })?;
            }
        }

        Ok(OpenFuture { receiver })
    }

    /// Blocks until the open started by [`begin_open`](Self::begin_open)
    /// completes, returning the bound address (passive) or the peer address
    /// (active).
    pub fn end_open(&self, future: OpenFuture) -> Result<SocketAddr, Error> {
        future.receiver.recv().map_err(|_| Error::DispatcherClosed)?
    }

    /// Starts closing the layer and returns immediately.
    ///
    /// Every registered connection is asked to close gracefully; connections
    /// with queued output get up to the handler shutdown timeout to flush it.
    #[instrument(skip(self))]
    pub fn begin_close(&mut self) -> CloseFuture {
        if self.state == LayerState::Open || self.state == LayerState::Unopened {
            info!(role = ?self.role, "Closing transport layer");
            self.state = LayerState::Closing;
        }
        self.dispatcher.begin_close()
    }

    /// Blocks until the close started by [`begin_close`](Self::begin_close)
    /// completes and the dispatcher thread has exited.
    pub fn end_close(&mut self, future: CloseFuture) -> Result<(), Error> {
        let result = self.dispatcher.end_close(future);
        self.state = LayerState::Closed;
        result
    }

    /// Bounds how long each connection is given to flush pending output
    /// during close before being forced closed.
    pub fn set_event_handler_shutdown_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.dispatcher.set_event_handler_shutdown_timeout(timeout)
    }

    /// Runs `task` on the dispatcher thread and blocks until it completes.
    ///
    /// This is the bridge for application threads that need an answer
    /// computed in the dispatcher's context, serialized with all connection
    /// activity.
    pub fn sync_exec<T, F>(&self, task: F) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatcher.sync_exec(move |_reactor| task())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress)?
        .next()
        .ok_or(Error::InvalidAddress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;

    struct NullContext;

    impl TransportContext for NullContext {
        fn create_service(&self) -> Box<dyn Service> {
            unreachable!("no connections in this test")
        }
    }

    fn config_with_role(role: &str) -> Config {
        Config::builder()
            .set_default("transport_role", role)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn role_parses_from_config() {
        assert_eq!(
            TransportRole::from_config(&config_with_role("active"), "").unwrap(),
            TransportRole::Active
        );
        assert_eq!(
            TransportRole::from_config(&config_with_role("passive"), "").unwrap(),
            TransportRole::Passive
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        let result = TransportRole::from_config(&config_with_role("observer"), "");
        match result {
            Err(Error::InvalidTransportRole { got, valid }) => {
                assert_eq!(got, "observer");
                assert_eq!(valid, vec!["active", "passive"]);
            }
            other => panic!("expected InvalidTransportRole, got {other:?}"),
        }
    }

    #[test]
    fn missing_role_is_a_config_error() {
        let config = Config::builder().build().unwrap();
        let result = TransportLayerFactory::create_transport_layer(&config, Arc::new(NullContext));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn namespaced_role_takes_priority() {
        let config = Config::builder()
            .set_default("transport_role", "active")
            .unwrap()
            .set_default("game_server.transport_role", "passive")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            TransportRole::from_config(&config, "game_server").unwrap(),
            TransportRole::Passive
        );
        assert_eq!(
            TransportRole::from_config(&config, "game_client").unwrap(),
            TransportRole::Active
        );
    }

    #[test]
    fn begin_open_is_one_shot() {
        let mut layer = TransportLayerFactory::create_transport_layer(
            &config_with_role("passive"),
            Arc::new(NullContext),
        )
        .unwrap();
        let future = layer.begin_open("127.0.0.1", 0).unwrap();
        layer.end_open(future).unwrap();
        assert!(matches!(
            layer.begin_open("127.0.0.1", 0),
            Err(Error::IllegalState { .. })
        ));

        let close = layer.begin_close();
        layer.end_close(close).unwrap();
    }

    #[test]
    fn begin_open_rejects_bad_host() {
        let mut layer = TransportLayerFactory::create_transport_layer(
            &config_with_role("passive"),
            Arc::new(NullContext),
        )
        .unwrap();
        assert!(matches!(
            layer.begin_open("definitely not a hostname", 0),
            Err(Error::InvalidAddress)
        ));
    }

    #[test]
    fn close_without_open_completes() {
        let mut layer = TransportLayerFactory::create_transport_layer(
            &config_with_role("active"),
            Arc::new(NullContext),
        )
        .unwrap();
        let future = layer.begin_close();
        layer.end_close(future).unwrap();
    }
}
