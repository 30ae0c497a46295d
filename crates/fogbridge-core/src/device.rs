//! Device-side identifiers shared by the registry, the platform channel
//! and the operator shell.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;

/// Opaque device identity. Keys the registry and names the device to the
/// platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Vec<u8>);

impl DeviceId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Fallback identity for a device that never told us a hardware id:
    /// the octets of its IP address. The port is left out so a device that
    /// rebinds its source port keeps its identity.
    pub fn from_address(addr: &SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V6(v6) => Self(v6.octets().to_vec()),
            IpAddr::V4(v4) => Self(v4.to_ipv6_mapped().octets().to_vec()),
        }
    }

    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(text).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Negotiated inter-network link descriptor. Owned by the platform; the
/// gateway stores it without looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkContract(Bytes);

impl LinkContract {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    /// Decode the hex form the platform sends in a link reply.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self::new)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Network technology a platform or device belongs to, as the fog names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Sixlowpan,
    Lorawan,
}
