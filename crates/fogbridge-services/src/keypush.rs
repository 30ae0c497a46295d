//! Key push — delivers platform-issued session keys to devices.
//!
//! The platform calls in on its own task when a link is up. The node is
//! looked up by identity and the raw key bytes are POSTed to the device's
//! key resource as a confirmable request. Undeliverable keys are reported
//! back to the platform; the gateway does not retry on its own.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{MessageClass, RequestType};

use fogbridge_core::config::{CoapConfig, PlatformConfig};
use fogbridge_core::{DeviceId, SessionKey};

use crate::client::{ClientError, CoapClient};
use crate::platform::KeyReceiver;
use crate::registry::NodeRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("node not found: {0}")]
    NodeNotFound(DeviceId),

    #[error("key delivery to {addr} failed: {source}")]
    Delivery {
        addr: SocketAddr,
        #[source]
        source: ClientError,
    },

    #[error("key delivery to {0} timed out")]
    Timeout(SocketAddr),
}

/// Where and how keys are delivered.
#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Port the device serves its key resource on. 0 = the port it last spoke from.
    pub device_port: u16,
    pub key_path: String,
    /// Hard ceiling on one delivery, retransmissions included.
    pub timeout: Duration,
}

impl PushSettings {
    pub fn from_config(coap: &CoapConfig, platform: &PlatformConfig) -> Self {
        Self {
            device_port: coap.device_port,
            key_path: coap.key_path.clone(),
            timeout: platform.key_push_timeout(),
        }
    }
}

pub struct KeyPusher {
    registry: NodeRegistry,
    client: CoapClient,
    settings: PushSettings,
}

impl KeyPusher {
    pub fn new(registry: NodeRegistry, client: CoapClient, settings: PushSettings) -> Self {
        Self {
            registry,
            client,
            settings,
        }
    }

    /// Deliver `key` to the device registered as `identity`.
    pub async fn push_key(&self, identity: &DeviceId, key: SessionKey) -> Result<(), PushError> {
        let node = self
            .registry
            .find_by_identity(identity)
            .ok_or_else(|| PushError::NodeNotFound(identity.clone()))?;

        let mut dest = node.addr;
        if self.settings.device_port != 0 {
            dest.set_port(self.settings.device_port);
        }

        tracing::info!(%identity, addr = %dest, "pushing key to node");

        let send = self.client.send(
            MessageClass::Request(RequestType::Post),
            dest,
            &self.settings.key_path,
            key.as_bytes(),
        );
        match tokio::time::timeout(self.settings.timeout, send).await {
            Err(_) => return Err(PushError::Timeout(dest)),
            Ok(Err(source)) => return Err(PushError::Delivery { addr: dest, source }),
            Ok(Ok(_)) => {}
        }

        if !self.registry.set_session_key(identity, key) {
            tracing::warn!(%identity, "node vanished while its key was in flight");
        }
        tracing::info!(%identity, "key delivered");
        Ok(())
    }
}

#[async_trait]
impl KeyReceiver for KeyPusher {
    async fn on_key_available(&self, identity: &DeviceId, key: SessionKey) -> Result<(), PushError> {
        self.push_key(identity, key).await
    }
}
