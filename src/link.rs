//! Transport links
//!
//! A link is one live transport session to a peer (a TCP connection, a
//! Bluetooth channel). Links are owned by the provider that created them;
//! the device only holds non-owning references and learns about incoming
//! packets and link destruction through its event channel.

use crate::device::DeviceEvent;
use crate::packet::NetworkPacket;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identity of one link, unique within the process
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh link id. Providers call this once per link they create.
pub fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// A transport-layer factory producing links of one kind
///
/// Providers are ranked by priority; a higher number wins when a device is
/// reachable over several transports at once.
pub trait LinkProvider: Send + Sync {
    /// Display name of the transport (shows up in `availableLinks`)
    fn name(&self) -> &str;

    /// Ranking among providers; higher is preferred
    fn priority(&self) -> i32;
}

/// One live transport session bound to a single peer
pub trait DeviceLink: Send + Sync {
    fn id(&self) -> LinkId;

    /// The provider this link belongs to
    fn provider(&self) -> &dyn LinkProvider;

    /// Hand a packet to the transport's outbound queue
    ///
    /// Returns `true` when the hand-off succeeded without a synchronous
    /// error. That is not a delivery guarantee; a link over an established
    /// but half-dead TCP session will still report success.
    fn send(&self, packet: &NetworkPacket) -> bool;

    /// Subscribe the device to this link's traffic
    ///
    /// After attachment the link emits
    /// [`DeviceEvent::PacketReceived`] for every inbound packet and a final
    /// [`DeviceEvent::LinkDestroyed`] exactly once before the provider
    /// releases the link.
    fn attach(&self, events: mpsc::UnboundedSender<DeviceEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_ids_are_unique() {
        let a = next_link_id();
        let b = next_link_id();
        assert_ne!(a, b);
    }
}
