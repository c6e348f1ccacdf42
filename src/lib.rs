//! Device and pairing core
//!
//! This library is the heart of a peer-to-peer connectivity daemon for
//! nearby personal devices: it owns the lifecycle of a remote device from
//! the moment a transport discovers it, through trust establishment, through
//! routing of application messages to feature plugins, until the device
//! becomes unreachable or is untrusted.
//!
//! ## Architecture
//!
//! - [`packet`]: the JSON message envelope, with RSA sealing and opening
//! - [`link`]: the contract transports implement, ranked by provider
//!   priority
//! - [`device`]: the central aggregate combining identity, trust state,
//!   live links and bound plugins behind a single send/receive interface
//! - [`pairing`]: the trust protocol types and the request timer
//! - [`plugins`]: the per-device feature plugin contract and loader
//! - [`config`]: the injected key-value store for trusted records, the
//!   identity keypair and plugin enablement
//!
//! The core runs single-threaded on one event loop. Links, timers and
//! plugins feed discrete events into each device; state changes travel
//! outward as signals. Transports, feature plugins beyond ping, UI and the
//! IPC surface are collaborators behind the interfaces defined here.

pub mod config;
pub mod crypto;
pub mod device;
pub mod identity;
pub mod link;
pub mod packet;
pub mod pairing;
pub mod plugins;

mod error;

pub use config::{ConfigHandle, ConfigStore, FileConfig, MemoryConfig};
pub use crypto::{LocalKeyPair, PeerPublicKey};
pub use device::{Device, DeviceEvent, DeviceHandle, DeviceSignal};
pub use error::{Error, Result};
pub use identity::{DeviceType, Identity};
pub use link::{DeviceLink, LinkId, LinkProvider};
pub use packet::NetworkPacket;
pub use pairing::{PairPacket, PairStatus, PairingFailure};
pub use plugins::{Plugin, PluginFactory, PluginInfo, PluginRegistry};

/// Protocol version we implement
pub const PROTOCOL_VERSION: i64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 5);
    }
}
