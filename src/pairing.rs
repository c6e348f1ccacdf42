//! Pairing protocol pieces
//!
//! Trust between two devices is established by exchanging `kdeconnect.pair`
//! packets carrying each side's public key. The state machine itself lives
//! in [`Device`](crate::Device); this module holds the status and failure
//! types, the pair packet builders, and the request timer.
//!
//! ## Protocol
//!
//! 1. The requester sends `{pair: true, publicKey: <own key>}` and waits
//!    up to 20 seconds.
//! 2. The peer surfaces the request to its user. Accepting answers with
//!    `{pair: true, publicKey: <own key>}`; rejecting answers with
//!    `{pair: false}`.
//! 3. Either side can revoke trust later with `{pair: false}`.

use crate::device::DeviceEvent;
use crate::packet::NetworkPacket;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Packet type for pair requests, answers and revocations
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// How long a pair request waits for the peer's answer
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(20);

/// Trust state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    /// No trust established
    NotPaired,
    /// We sent a pair request and are waiting for the answer
    PairRequested,
    /// Mutual trust established, peer key persisted
    Paired,
}

impl PairStatus {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairStatus::Paired)
    }
}

/// Why a pairing attempt ended without trust being established
///
/// These are stable reason codes; `Display` yields the human string shown
/// to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    AlreadyPaired,
    AlreadyRequested,
    NotReachable,
    ContactError,
    TimedOut,
    CanceledByPeer,
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PairingFailure::AlreadyPaired => "Already paired",
            PairingFailure::AlreadyRequested => "Pairing already requested for this device",
            PairingFailure::NotReachable => "Device not reachable",
            PairingFailure::ContactError => "Error contacting device",
            PairingFailure::TimedOut => "Timed out",
            PairingFailure::CanceledByPeer => "Canceled by other peer",
        };
        f.write_str(text)
    }
}

/// Parsed content of a `kdeconnect.pair` packet
#[derive(Debug, Clone)]
pub struct PairPacket {
    /// `true` requests or confirms pairing, `false` rejects or revokes it
    pub pair: bool,

    /// The sender's public key, base64 DER; present on requests and accepts
    pub public_key: Option<String>,
}

impl PairPacket {
    /// Build a pair request carrying our public key
    pub fn request(public_key: &str) -> NetworkPacket {
        let mut packet = NetworkPacket::new(PACKET_TYPE_PAIR);
        packet.set("pair", true);
        packet.set("publicKey", public_key);
        packet
    }

    /// Build a pair accept answer; same shape as a request
    pub fn accept(public_key: &str) -> NetworkPacket {
        Self::request(public_key)
    }

    /// Build a pair reject answer
    pub fn reject() -> NetworkPacket {
        let mut packet = NetworkPacket::new(PACKET_TYPE_PAIR);
        packet.set("pair", false);
        packet
    }

    /// Build an unpair notice; same shape as a reject
    pub fn unpair() -> NetworkPacket {
        Self::reject()
    }

    /// Parse a pair packet
    pub fn from_packet(packet: &NetworkPacket) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(Error::MalformedPacket("not a pair packet".to_string()));
        }

        let pair = packet
            .get::<bool>("pair")
            .ok_or_else(|| Error::MalformedPacket("pair packet without pair field".to_string()))?;

        Ok(Self {
            pair,
            public_key: packet.get("publicKey"),
        })
    }
}

/// The pair request timer
///
/// Armed exactly while the device is in [`PairStatus::PairRequested`]; on
/// expiry it posts [`DeviceEvent::PairingTimeout`] to the device's event
/// channel. Stopping aborts the task, so a stopped timer never fires.
#[derive(Debug, Default)]
pub(crate) struct PairingTimer {
    handle: Option<JoinHandle<()>>,
}

impl PairingTimer {
    pub fn start(&mut self, events: mpsc::UnboundedSender<DeviceEvent>, timeout: Duration) {
        self.stop();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(DeviceEvent::PairingTimeout);
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PairingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
