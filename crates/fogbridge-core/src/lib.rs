//! fogbridge-core — shared types, wire helpers, and configuration.
//! All other fogbridge crates depend on this one.

pub mod config;
pub mod crypto;
pub mod device;
pub mod wire;

pub use crypto::{SessionKey, KEY_SIZE};
pub use device::{DeviceId, LinkContract, NetworkKind};
pub use wire::{InfType, WireError};
