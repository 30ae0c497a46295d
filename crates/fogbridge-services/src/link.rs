//! `/req` — turns a device's link request into a platform link request.
//!
//! Unknown senders are added to the registry and registered with the
//! platform first. A known device speaking from a new port keeps its entry,
//! which follows it to the new address. Every failure ends the exchange without a reply unless
//! explicit errors are enabled; the device's CoAP stack retries on timeout.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::{Packet, ResponseType};

use fogbridge_core::wire::{self, WireError, LINK_REQUESTED_PAYLOAD};
use fogbridge_core::{DeviceId, InfType, NetworkKind};

use crate::dispatch::CoapHandler;
use crate::platform::{DeviceRegistration, Platform, PlatformError};
use crate::registry::{Node, NodeRegistry};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("device registration failed: {0}")]
    Registration(#[source] PlatformError),

    #[error("malformed link request: {0}")]
    Malformed(#[from] WireError),

    #[error("link request failed: {0}")]
    Link(#[source] PlatformError),
}

impl LinkError {
    /// Code used when explicit error replies are enabled.
    pub fn response_code(&self) -> ResponseType {
        match self {
            LinkError::Malformed(_) => ResponseType::BadRequest,
            LinkError::Registration(_) | LinkError::Link(_) => ResponseType::BadGateway,
        }
    }
}

pub struct LinkRequestHandler {
    registry: NodeRegistry,
    platform: Arc<dyn Platform>,
    /// Announced to the platform as the endpoint serving new devices.
    platform_address: String,
    explicit_errors: bool,
}

impl LinkRequestHandler {
    pub fn new(
        registry: NodeRegistry,
        platform: Arc<dyn Platform>,
        platform_address: String,
        explicit_errors: bool,
    ) -> Self {
        Self {
            registry,
            platform,
            platform_address,
            explicit_errors,
        }
    }

    /// Resolve the sender, decode the requested type and forward the link request.
    pub async fn process(&self, source: SocketAddr, payload: &[u8]) -> Result<DeviceId, LinkError> {
        let node = match self.registry.find_by_address(&source) {
            Some(node) => node,
            None => {
                let identity = DeviceId::from_address(&source);
                match self.registry.relocate(&identity, source) {
                    Some(node) => node,
                    None => {
                        let node = Node::new(identity, source);
                        self.registry.upsert(node.clone());
                        node
                    }
                }
            }
        };

        // A node whose registration failed earlier is retried on its next request.
        if !node.registered {
            self.register(&node.identity).await?;
        }

        let inf_type = InfType::from_payload(payload)?;

        tracing::debug!(identity = %node.identity, %inf_type, "requesting link");
        let contract = self
            .platform
            .request_link(&node.identity, inf_type)
            .await
            .map_err(LinkError::Link)?;

        if let Some(contract) = contract {
            tracing::debug!(identity = %node.identity, len = contract.len(), "link contract granted");
            self.registry.set_link(&node.identity, contract);
        }

        Ok(node.identity)
    }

    async fn register(&self, identity: &DeviceId) -> Result<(), LinkError> {
        let registration = DeviceRegistration {
            identity: identity.clone(),
            inf_type: InfType::DEFAULT,
            is_provider: false,
            platform_address: self.platform_address.clone(),
            platform_kind: NetworkKind::Sixlowpan,
        };
        self.platform
            .register_device(registration)
            .await
            .map_err(LinkError::Registration)?;
        self.registry.mark_registered(identity);
        tracing::info!(%identity, "device registered with platform");
        Ok(())
    }
}

#[async_trait]
impl CoapHandler for LinkRequestHandler {
    async fn handle(&self, source: SocketAddr, request: &Packet) -> Option<Packet> {
        let confirmable = wire::is_confirmable(request);
        match self.process(source, &request.payload).await {
            Ok(identity) => {
                tracing::info!(%identity, %source, "link request forwarded to platform");
                confirmable
                    .then(|| wire::ack_for(request, ResponseType::Content, LINK_REQUESTED_PAYLOAD))
            }
            Err(e) => {
                tracing::warn!(%source, error = %e, "dropping link request");
                (confirmable && self.explicit_errors)
                    .then(|| wire::ack_for(request, e.response_code(), b""))
            }
        }
    }
}
