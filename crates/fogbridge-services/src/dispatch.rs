//! Routes incoming CoAP requests to the handler registered for their path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::{Packet, ResponseType};

use fogbridge_core::wire::{self, HELLO_PAYLOAD};

/// A handler for one URI path.
///
/// Returns the response to send, or `None` to stay silent.
#[async_trait]
pub trait CoapHandler: Send + Sync {
    async fn handle(&self, source: SocketAddr, request: &Packet) -> Option<Packet>;
}

/// Maps URI paths to handlers and dispatches incoming requests.
#[derive(Default)]
pub struct Router {
    /// Path without leading slash -> handler.
    routes: HashMap<String, Arc<dyn CoapHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Leading and trailing slashes in `path` are ignored.
    pub fn register(&mut self, path: &str, handler: Arc<dyn CoapHandler>) {
        self.routes
            .insert(path.trim_matches('/').to_string(), handler);
    }

    /// Dispatch a request. Unknown paths get 4.04 when confirmable.
    pub async fn route(&self, source: SocketAddr, request: &Packet) -> Option<Packet> {
        let path = wire::request_path(request);
        match self.routes.get(&path) {
            Some(handler) => {
                tracing::debug!(%source, path, "dispatching request");
                handler.handle(source, request).await
            }
            None => {
                tracing::debug!(%source, path, "no handler for path");
                wire::is_confirmable(request)
                    .then(|| wire::ack_for(request, ResponseType::NotFound, b""))
            }
        }
    }
}

/// `/hello`: answers confirmable liveness checks and ignores the rest.
pub struct HelloHandler;

#[async_trait]
impl CoapHandler for HelloHandler {
    async fn handle(&self, source: SocketAddr, request: &Packet) -> Option<Packet> {
        if !wire::is_confirmable(request) {
            tracing::trace!(%source, "non-confirmable hello, not answering");
            return None;
        }
        Some(wire::ack_for(request, ResponseType::Content, HELLO_PAYLOAD))
    }
}
