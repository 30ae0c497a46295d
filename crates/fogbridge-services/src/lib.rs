//! fogbridge-services — the gateway's stateful core.
//!
//! Node registry, the `/hello` and `/req` handlers, the key-push path and
//! the CoAP plumbing they share, plus the fog platform client and its TLS
//! setup.

pub mod client;
pub mod dispatch;
pub mod fog;
pub mod keypush;
pub mod link;
pub mod platform;
pub mod registry;
pub mod server;
pub mod tls;

pub use client::{ClientConfig, ClientError, CoapClient, Reply};
pub use dispatch::{CoapHandler, HelloHandler, Router};
pub use fog::FogClient;
pub use keypush::{KeyPusher, PushError, PushSettings};
pub use link::{LinkError, LinkRequestHandler};
pub use platform::{DeviceRegistration, KeyReceiver, Platform, PlatformError};
pub use registry::{Node, NodeRegistry};
pub use server::GatewayServer;
pub use tls::{PlatformTls, TlsError};
