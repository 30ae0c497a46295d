//! Platform collaborator — the fog control plane as the gateway sees it.
//!
//! Two calls go out (register a device, request a link) and one comes back
//! (a session key is available). Both directions are traits so the gateway
//! can be driven by the real fog client or by a test double.

use async_trait::async_trait;
use fogbridge_core::{DeviceId, InfType, LinkContract, NetworkKind, SessionKey};

use crate::keypush::PushError;

/// Everything the platform needs to admit a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub identity: DeviceId,
    pub inf_type: InfType,
    /// Whether the device offers data (true) or consumes it (false).
    pub is_provider: bool,
    /// Address of the platform endpoint serving this device.
    pub platform_address: String,
    pub platform_kind: NetworkKind,
}

/// Outbound calls into the fog platform.
///
/// Implementations bound each call by their own timeout.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn register_device(&self, registration: DeviceRegistration) -> Result<(), PlatformError>;

    /// Ask for a link. The platform may answer with the negotiated contract.
    async fn request_link(&self, identity: &DeviceId, inf_type: InfType)
        -> Result<Option<LinkContract>, PlatformError>;
}

/// Receives session keys the platform pushes once a link is established.
///
/// Invoked on the platform's own task, never from the CoAP request path.
#[async_trait]
pub trait KeyReceiver: Send + Sync {
    async fn on_key_available(&self, identity: &DeviceId, key: SessionKey)
        -> Result<(), PushError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("platform rejected the request: {0}")]
    Rejected(String),

    #[error("platform protocol error: {0}")]
    Protocol(String),

    #[error("platform did not answer in time")]
    Timeout,

    #[error("platform connection closed")]
    Closed,
}
