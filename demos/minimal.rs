//! Minimal example - Envelope echo between two transport layers
//!
//! This example demonstrates the most basic usage of a transport layer pair:
//! a passive (server) layer whose service echoes every envelope back, and an
//! active (client) layer that sends one envelope and prints the echo.
//!
//! ## What it shows
//!
//! - Creating layers from configuration (`transport_role` decides the side)
//! - Split-phase open: `begin_open` returns a future, `end_open` blocks on it
//! - Services reacting to decoded envelopes on the dispatcher thread
//! - Split-phase close of both layers
//!
//! # Usage
//!
//! ```bash
//! cargo run --example minimal
//! ```

use config::Config;
use std::str::from_utf8;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use tablewire::prelude::*;
use tablewire::NO_CORRELATION_ID;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tablewire; control verbosity via RUST_LOG
/// (e.g. `RUST_LOG=tablewire=debug cargo run --example minimal`).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// Server side: echoes every envelope back, correlated to the request.
struct EchoService;

impl Service for EchoService {
    fn message_received(&mut self, context: &mut dyn ServiceContext, envelope: MessageEnvelope) {
        let reply = MessageEnvelope::new(envelope.id(), envelope.id(), envelope.into_body());
        context.send_message(reply);
    }
}

struct EchoContext;

impl TransportContext for EchoContext {
    fn create_service(&self) -> Box<dyn Service> {
        Box::new(EchoService)
    }
}

/// Client side: sends one greeting and forwards the echo to the main thread.
struct GreeterService {
    received: Sender<MessageEnvelope>,
}

impl Service for GreeterService {
    fn started(&mut self, context: &mut dyn ServiceContext) {
        let greeting = b"Hello, tablewire!".to_vec();
        context.send_message(MessageEnvelope::new(1, NO_CORRELATION_ID, greeting));
    }

    fn message_received(&mut self, _context: &mut dyn ServiceContext, envelope: MessageEnvelope) {
        let _ = self.received.send(envelope);
    }
}

struct GreeterContext {
    received: Sender<MessageEnvelope>,
}

impl TransportContext for GreeterContext {
    fn create_service(&self) -> Box<dyn Service> {
        Box::new(GreeterService {
            received: self.received.clone(),
        })
    }
}

fn role_config(role: &str) -> Config {
    Config::builder()
        .set_default("transport_role", role)
        .expect("Failed to set transport role")
        .build()
        .expect("Failed to build config")
}

fn main() {
    init_tracing();

    // Start the server layer.
    let mut server =
        TransportLayerFactory::create_transport_layer(&role_config("passive"), Arc::new(EchoContext))
            .expect("Failed to create server layer");
    let open = server
        .begin_open("127.0.0.1", 0)
        .expect("Failed to begin opening server");
    let server_addr = server.end_open(open).expect("Failed to open server");
    println!("Server listening on {server_addr}\n");

    // Connect the client layer.
    let (received_tx, received_rx) = channel();
    let context = Arc::new(GreeterContext {
        received: received_tx,
    });
    let mut client = TransportLayerFactory::create_transport_layer(&role_config("active"), context)
        .expect("Failed to create client layer");
    let open = client
        .begin_open("127.0.0.1", server_addr.port())
        .expect("Failed to begin opening client");
    client.end_open(open).expect("Failed to connect to server");

    // The greeting is sent as soon as the connection is up; wait for the echo.
    let echo = received_rx.recv().expect("Failed to receive echo");
    println!(
        "Received echo: {:?}",
        from_utf8(echo.body()).expect("echo is valid UTF-8")
    );

    // Close both layers.
    let client_close = client.begin_close();
    let server_close = server.begin_close();
    client.end_close(client_close).expect("Failed to close client");
    server.end_close(server_close).expect("Failed to close server");
    println!("Both layers closed");
}
