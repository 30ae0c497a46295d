//! Key material and randomness for fogbridge.
//!
//! The gateway never derives keys itself. Session keys arrive from the fog
//! platform and are passed through to devices verbatim; `SessionKey` is
//! wiped on drop and redacted in `Debug` output.
//!
//! There is no unsafe code in this module.

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::{WireError, TOKEN_LEN};

/// Size of a device session key in bytes.
pub const KEY_SIZE: usize = 16;

// ── Session key ───────────────────────────────────────────────────────────────

/// Device session key handed out by the platform once a link is established.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Parse the hex form used on the platform channel.
    pub fn from_hex(text: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(text).map_err(|e| WireError::Malformed(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = WireError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| WireError::KeyLength {
            expected: KEY_SIZE,
            got: bytes.len(),
        })?;
        Ok(Self(array))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

// ── Message identifiers ───────────────────────────────────────────────────────

/// Random CoAP message id for a new outbound exchange.
pub fn generate_message_id() -> u16 {
    (rand::thread_rng().next_u32() & 0xffff) as u16
}

/// Random CoAP token for a new outbound exchange.
pub fn generate_token() -> [u8; TOKEN_LEN] {
    let mut token = [0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut token);
    token
}
