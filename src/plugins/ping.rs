//! Ping plugin
//!
//! Connectivity check: either side can fire a `kdeconnect.ping` packet at
//! the other, optionally carrying a short message. Received pings are
//! counted and logged; there is no reply.

use super::{Plugin, PluginFactory};
use crate::device::DeviceHandle;
use crate::packet::NetworkPacket;
use tracing::{debug, info};

/// Packet type for pings
pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

/// Ping plugin instance, one per device
pub struct PingPlugin {
    device: DeviceHandle,
    pings_received: u64,
}

impl PingPlugin {
    fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            pings_received: 0,
        }
    }

    /// Number of pings received from this device
    pub fn pings_received(&self) -> u64 {
        self.pings_received
    }

    /// Build a ping packet, optionally carrying a message
    pub fn create_ping(message: Option<&str>) -> NetworkPacket {
        let mut packet = NetworkPacket::new(PACKET_TYPE_PING);
        if let Some(message) = message {
            packet.set("message", message);
        }
        packet
    }

    /// Fire a ping at the peer
    pub fn send_ping(&self, message: Option<&str>) -> bool {
        self.device.send(Self::create_ping(message))
    }
}

impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    fn receive(&mut self, packet: &NetworkPacket) -> bool {
        if !packet.is_type(PACKET_TYPE_PING) {
            return false;
        }

        self.pings_received += 1;
        match packet.get::<String>("message") {
            Some(message) => info!(
                "ping from {}: {message}",
                self.device.device_name()
            ),
            None => info!("ping from {}", self.device.device_name()),
        }
        true
    }

    fn connected(&mut self) {
        debug!("ping plugin ready for {}", self.device.device_name());
    }
}

/// Factory registering the ping plugin
pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn description(&self) -> &str {
        "Send and receive pings"
    }

    fn create(&self, handle: DeviceHandle) -> Box<dyn Plugin> {
        Box::new(PingPlugin::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceEvent;
    use tokio::sync::mpsc;

    fn plugin() -> (PingPlugin, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::new("dev_1".to_string(), "Phone".to_string(), tx);
        (PingPlugin::new(handle), rx)
    }

    #[test]
    fn test_receive_counts_pings() {
        let (mut ping, _rx) = plugin();

        assert!(ping.receive(&PingPlugin::create_ping(None)));
        assert!(ping.receive(&PingPlugin::create_ping(Some("hello"))));
        assert_eq!(ping.pings_received(), 2);
    }

    #[test]
    fn test_ignores_other_packet_types() {
        let (mut ping, _rx) = plugin();

        let packet = NetworkPacket::new("kdeconnect.battery");
        assert!(!ping.receive(&packet));
        assert_eq!(ping.pings_received(), 0);
    }

    #[test]
    fn test_send_ping_goes_through_device() {
        let (ping, mut rx) = plugin();

        assert!(ping.send_ping(Some("are you there")));
        match rx.try_recv() {
            Ok(DeviceEvent::SendRequest(packet)) => {
                assert!(packet.is_type(PACKET_TYPE_PING));
                assert_eq!(packet.get::<String>("message").unwrap(), "are you there");
            }
            other => panic!("expected a send request, got {other:?}"),
        }
    }

    #[test]
    fn test_ping_packet_shape() {
        let packet = PingPlugin::create_ping(None);
        assert!(packet.is_type(PACKET_TYPE_PING));
        assert!(!packet.has("message"));
    }
}
