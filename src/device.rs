//! Device state and lifecycle
//!
//! The device is the central aggregate of the core: a durable peer identity
//! that may be reachable over any number of concurrent transport links and
//! presents one send/receive interface to the rest of the daemon.
//!
//! ## Lifecycle
//!
//! 1. **Discovery**: a transport hands over an identity packet and a link;
//!    the device starts out untrusted but reachable.
//! 2. **Pairing**: public keys are exchanged and persisted; see
//!    [`crate::pairing`] for the protocol.
//! 3. **Operation**: packets to the peer are sealed with its key and routed
//!    over the highest-priority live link; incoming packets are opened and
//!    fanned out to the bound plugins.
//! 4. **Unreachable**: when the last link dies the plugins unload; the
//!    trusted record survives for the next discovery.
//!
//! Everything on a device runs on one event loop. Links, the pairing timer
//! and plugins feed [`DeviceEvent`]s into the device's channel; state
//! changes travel outward as [`DeviceSignal`]s.

use crate::config::{device_ns, device_plugins_ns, ConfigHandle};
use crate::crypto::{LocalKeyPair, PeerPublicKey};
use crate::identity::Identity;
use crate::link::{DeviceLink, LinkId};
use crate::pairing::{
    PairPacket, PairStatus, PairingFailure, PairingTimer, PACKET_TYPE_PAIR, PAIRING_TIMEOUT,
};
use crate::packet::NetworkPacket;
use crate::plugins::{ping::PingPlugin, Plugin, PluginRegistry};
use crate::{Error, Result};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events delivered to a device's event loop
#[derive(Debug)]
pub enum DeviceEvent {
    /// A link received a packet from the wire
    PacketReceived {
        link_id: LinkId,
        packet: NetworkPacket,
    },

    /// A link is gone; the device must drop its reference
    LinkDestroyed { link_id: LinkId },

    /// The pair request timer expired
    PairingTimeout,

    /// A plugin asked the device to send a packet
    SendRequest(NetworkPacket),
}

/// State changes a device reports to the daemon and its UI clients
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSignal {
    /// The device gained its first link or lost its last one
    ReachabilityChanged { reachable: bool },

    /// A locally requested pairing completed
    PairingSucceeded,

    /// A pairing attempt ended without trust being established
    PairingFailed(PairingFailure),

    /// The set of loaded plugins changed
    PluginsChanged { loaded: Vec<String> },

    /// The peer asked to pair; the user must accept or reject
    PairRequestReceived {
        device_id: String,
        device_name: String,
    },
}

/// Non-owning back-reference handed to plugins
///
/// Carries the device identity and a way to queue outbound packets; the
/// owning device seals and routes them on its own loop. The handle stays
/// valid after the device is gone, sends just start failing.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device_id: String,
    device_name: String,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceHandle {
    pub fn new(
        device_id: String,
        device_name: String,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            device_id,
            device_name,
            events,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Queue a packet for sending through the owning device
    pub fn send(&self, packet: NetworkPacket) -> bool {
        self.events.send(DeviceEvent::SendRequest(packet)).is_ok()
    }
}

/// A remote peer
pub struct Device {
    id: String,
    name: String,
    pair_status: PairStatus,
    peer_key: Option<PeerPublicKey>,
    links: Vec<Arc<dyn DeviceLink>>,
    plugins: HashMap<String, Box<dyn Plugin>>,
    pairing_timer: PairingTimer,
    config: ConfigHandle,
    registry: Arc<PluginRegistry>,
    signals: mpsc::UnboundedSender<DeviceSignal>,
    event_tx: mpsc::UnboundedSender<DeviceEvent>,
    event_rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Device {
    fn new(
        id: String,
        name: String,
        pair_status: PairStatus,
        peer_key: Option<PeerPublicKey>,
        config: ConfigHandle,
        registry: Arc<PluginRegistry>,
        signals: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            id,
            name,
            pair_status,
            peer_key,
            links: Vec::new(),
            plugins: HashMap::new(),
            pairing_timer: PairingTimer::default(),
            config,
            registry,
            signals,
            event_tx,
            event_rx,
        }
    }

    /// Restore a trusted device from its persisted record
    ///
    /// The device starts out paired but unreachable, with no plugins bound.
    /// Fails with [`Error::DeviceNotFound`] when no record with a usable
    /// public key exists for `device_id`.
    pub fn from_storage(
        device_id: &str,
        config: ConfigHandle,
        registry: Arc<PluginRegistry>,
        signals: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Result<Self> {
        let ns = device_ns(device_id);
        let name = config
            .read(&ns, "name")
            .unwrap_or_else(|| "unnamed".to_string());
        let key = config
            .read(&ns, "publicKey")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        let peer_key = PeerPublicKey::from_base64_der(&key)?;

        info!("restored paired device {name} ({device_id})");
        Ok(Self::new(
            device_id.to_string(),
            name,
            PairStatus::Paired,
            Some(peer_key),
            config,
            registry,
            signals,
        ))
    }

    /// Create a device freshly discovered by a transport
    ///
    /// The device starts out untrusted with `link` as its only transport.
    pub fn from_identity(
        identity: &Identity,
        link: Arc<dyn DeviceLink>,
        config: ConfigHandle,
        registry: Arc<PluginRegistry>,
        signals: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Self {
        info!(
            "discovered device {} ({})",
            identity.device_name, identity.device_id
        );
        let mut device = Self::new(
            identity.device_id.clone(),
            identity.device_name.clone(),
            PairStatus::NotPaired,
            None,
            config,
            registry,
            signals,
        );
        device.add_link(link);
        device
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pair_status(&self) -> PairStatus {
        self.pair_status
    }

    pub fn is_paired(&self) -> bool {
        self.pair_status.is_paired()
    }

    /// A device is reachable while it has at least one live link
    pub fn is_reachable(&self) -> bool {
        !self.links.is_empty()
    }

    /// Provider names of the live links, best first
    pub fn available_links(&self) -> Vec<String> {
        self.links
            .iter()
            .map(|l| l.provider().name().to_string())
            .collect()
    }

    /// Names of the currently bound plugins
    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// The back-reference plugins use to talk to this device
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.id.clone(), self.name.clone(), self.event_tx.clone())
    }

    /// Take note of a fresh identity announcement for this peer
    ///
    /// Peers may rename themselves between discoveries.
    pub fn update_identity(&mut self, identity: &Identity) {
        if identity.device_id != self.id {
            warn!(
                "identity for {} delivered to device {}",
                identity.device_id, self.id
            );
            return;
        }
        if identity.device_name != self.name {
            debug!("device {} renamed to {}", self.name, identity.device_name);
            self.name = identity.device_name.clone();
        }
    }

    fn emit(&self, signal: DeviceSignal) {
        let _ = self.signals.send(signal);
    }

    // ── Link management ─────────────────────────────────────────

    /// Adopt a new link to this peer
    ///
    /// The link set stays sorted by descending provider priority; equal
    /// priorities keep their insertion order. The first link makes the
    /// device reachable and loads its plugins; further links only tell the
    /// already-bound plugins to re-announce their state on the new
    /// transport.
    pub fn add_link(&mut self, link: Arc<dyn DeviceLink>) {
        debug!(
            "adding link to {} via {}",
            self.name,
            link.provider().name()
        );

        link.attach(self.event_tx.clone());
        self.links.push(link);
        self.links.sort_by_key(|l| Reverse(l.provider().priority()));

        if self.links.len() == 1 {
            self.reload_plugins();
            self.emit(DeviceSignal::ReachabilityChanged { reachable: true });
        } else {
            for plugin in self.plugins.values_mut() {
                plugin.connected();
            }
        }
    }

    /// Drop the reference to a dead or withdrawn link
    ///
    /// No-op when the link is not held. Losing the last link unloads all
    /// plugins.
    pub fn remove_link(&mut self, link_id: LinkId) {
        let before = self.links.len();
        self.links.retain(|l| l.id() != link_id);
        if self.links.len() == before {
            return;
        }

        debug!(
            "removed link from {}, {} remaining",
            self.name,
            self.links.len()
        );

        if self.links.is_empty() {
            self.reload_plugins();
            self.emit(DeviceSignal::ReachabilityChanged { reachable: false });
        }
    }

    // ── Sending ─────────────────────────────────────────────────

    /// Send a packet to the peer
    ///
    /// Paired devices get the packet sealed with their persisted public
    /// key; for unpaired devices it goes out in the clear, which only
    /// identity and pairing traffic should do. Links are tried in priority
    /// order and the first successful hand-off wins. Returns `false` when
    /// sealing fails, every link refuses, or no link exists.
    pub fn send(&self, mut packet: NetworkPacket) -> bool {
        if let Some(key) = &self.peer_key {
            if self.pair_status.is_paired() {
                if let Err(e) = packet.seal(key) {
                    warn!("could not seal packet for {}: {e}", self.name);
                    return false;
                }
            }
        }

        for link in &self.links {
            if link.send(&packet) {
                return true;
            }
        }
        false
    }

    /// Fire a ping at the peer
    pub fn send_ping(&self) -> bool {
        let ok = self.send(PingPlugin::create_ping(None));
        debug!("ping to {}: {}", self.name, ok);
        ok
    }

    // ── Event intake ────────────────────────────────────────────

    /// Dispatch one event
    pub fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PacketReceived { packet, .. } => self.handle_packet(packet),
            DeviceEvent::LinkDestroyed { link_id } => self.remove_link(link_id),
            DeviceEvent::PairingTimeout => self.pairing_timeout(),
            DeviceEvent::SendRequest(packet) => {
                self.send(packet);
            }
        }
    }

    /// Dispatch everything already queued, without waiting
    pub fn pump(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
        }
    }

    /// Run the device's event loop until every event sender is gone
    pub async fn run(&mut self) {
        while let Some(event) = self.event_rx.recv().await {
            self.handle_event(event);
        }
    }

    // ── Receiving ───────────────────────────────────────────────

    /// Process one packet received from any link
    pub fn handle_packet(&mut self, packet: NetworkPacket) {
        if packet.is_type(PACKET_TYPE_PAIR) {
            self.handle_pair_packet(&packet);
        } else if !self.is_paired() {
            debug!(
                "device {} not paired, ignoring {} packet",
                self.name,
                packet.packet_type()
            );
        } else if !packet.is_encrypted() {
            // The peer may not know yet that we consider it paired
            warn!(
                "paired device {} sent an unencrypted {} packet",
                self.name,
                packet.packet_type()
            );
            self.dispatch_to_plugins(&packet);
        } else {
            match self.open_packet(&packet) {
                Ok(opened) => self.dispatch_to_plugins(&opened),
                Err(e) => warn!("dropping undecryptable packet from {}: {e}", self.name),
            }
        }
    }

    fn open_packet(&self, packet: &NetworkPacket) -> Result<NetworkPacket> {
        // Read the private key through the store every time; it may be
        // replaced underneath us by a configuration change
        let keys = LocalKeyPair::load(&self.config)?;
        packet.open(&keys)
    }

    fn dispatch_to_plugins(&mut self, packet: &NetworkPacket) {
        let mut handled = false;
        for plugin in self.plugins.values_mut() {
            handled |= plugin.receive(packet);
        }
        if !handled {
            debug!(
                "no plugin consumed {} packet from {}",
                packet.packet_type(),
                self.name
            );
        }
    }

    // ── Pairing state machine ───────────────────────────────────

    fn handle_pair_packet(&mut self, packet: &NetworkPacket) {
        let pair = match PairPacket::from_packet(packet) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("ignoring bad pair packet from {}: {e}", self.name);
                return;
            }
        };

        match (self.pair_status, pair.pair) {
            (PairStatus::NotPaired, true) => self.peer_requested_pairing(pair),
            (PairStatus::NotPaired, false) => {
                debug!("{} confirmed we are unpaired", self.name);
            }
            (PairStatus::PairRequested, true) => self.peer_accepted_pairing(pair),
            (PairStatus::PairRequested, false) => {
                debug!("{} canceled our pair request", self.name);
                self.pair_status = PairStatus::NotPaired;
                self.pairing_timer.stop();
                self.emit(DeviceSignal::PairingFailed(PairingFailure::CanceledByPeer));
            }
            (PairStatus::Paired, true) => {
                debug!("{} re-requested pairing, already paired", self.name);
            }
            (PairStatus::Paired, false) => self.peer_unpaired(),
        }
    }

    /// Incoming pair request: capture the peer's key and ask the user
    fn peer_requested_pairing(&mut self, pair: PairPacket) {
        let Some(key) = pair.public_key else {
            warn!("pair request from {} without a public key", self.name);
            return;
        };

        match PeerPublicKey::from_base64_der(&key) {
            Ok(peer_key) => {
                info!("pair request from {}", self.name);
                self.peer_key = Some(peer_key);
                self.emit(DeviceSignal::PairRequestReceived {
                    device_id: self.id.clone(),
                    device_name: self.name.clone(),
                });
            }
            Err(e) => warn!("pair request from {} with a bad key: {e}", self.name),
        }
    }

    /// The peer answered our pair request affirmatively
    fn peer_accepted_pairing(&mut self, pair: PairPacket) {
        let Some(key) = pair.public_key else {
            warn!("pair answer from {} without a public key", self.name);
            return;
        };

        match PeerPublicKey::from_base64_der(&key) {
            Ok(peer_key) => {
                info!("paired with {}", self.name);
                self.persist_trusted_record(&key);
                self.peer_key = Some(peer_key);
                self.pair_status = PairStatus::Paired;
                self.pairing_timer.stop();
                self.emit(DeviceSignal::PairingSucceeded);
                self.reload_plugins();
            }
            Err(e) => warn!("pair answer from {} with a bad key: {e}", self.name),
        }
    }

    /// The peer revoked an established pairing
    fn peer_unpaired(&mut self) {
        info!("{} unpaired from us", self.name);
        self.pair_status = PairStatus::NotPaired;
        self.peer_key = None;
        self.config.delete(&device_ns(&self.id));
        self.reload_plugins();
    }

    /// Ask the peer to pair with us
    ///
    /// Sends our public key and arms the 20 second answer timer. Failures
    /// leave the state untouched and are reported through
    /// [`DeviceSignal::PairingFailed`].
    pub fn request_pair(&mut self) {
        match self.pair_status {
            PairStatus::Paired => {
                self.emit(DeviceSignal::PairingFailed(PairingFailure::AlreadyPaired));
                return;
            }
            PairStatus::PairRequested => {
                self.emit(DeviceSignal::PairingFailed(PairingFailure::AlreadyRequested));
                return;
            }
            PairStatus::NotPaired => {}
        }

        if !self.is_reachable() {
            self.emit(DeviceSignal::PairingFailed(PairingFailure::NotReachable));
            return;
        }

        let own_key = match self.own_public_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("cannot load own public key: {e}");
                self.emit(DeviceSignal::PairingFailed(PairingFailure::ContactError));
                return;
            }
        };

        if !self.send(PairPacket::request(&own_key)) {
            self.emit(DeviceSignal::PairingFailed(PairingFailure::ContactError));
            return;
        }

        info!("pair request sent to {}", self.name);
        self.pair_status = PairStatus::PairRequested;
        self.pairing_timer
            .start(self.event_tx.clone(), PAIRING_TIMEOUT);
    }

    /// Revoke an established pairing
    ///
    /// Forgets the peer key, deletes the persisted record, tells the peer
    /// on a best-effort basis and unloads the plugins.
    pub fn unpair(&mut self) {
        if !self.is_paired() {
            return;
        }

        info!("unpairing from {}", self.name);
        self.pair_status = PairStatus::NotPaired;
        self.pairing_timer.stop();
        self.peer_key = None;
        self.config.delete(&device_ns(&self.id));

        if self.is_reachable() {
            self.send(PairPacket::unpair());
        }

        self.reload_plugins();
    }

    /// The user accepted the peer's pair request
    ///
    /// Answers with our public key; only when the answer could be handed to
    /// a transport is the peer persisted as trusted.
    pub fn accept_pairing(&mut self) {
        if self.pair_status != PairStatus::NotPaired {
            warn!("accept_pairing in state {:?}", self.pair_status);
            return;
        }
        let Some(peer_key) = &self.peer_key else {
            warn!("accept_pairing without a pending pair request");
            return;
        };
        let peer_key_encoded = peer_key.to_base64_der();

        let own_key = match self.own_public_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("cannot load own public key: {e}");
                return;
            }
        };

        if !self.send(PairPacket::accept(&own_key)) {
            warn!("could not answer pair request from {}", self.name);
            return;
        }

        info!("accepted pair request from {}", self.name);
        self.persist_trusted_record(&peer_key_encoded);
        self.pair_status = PairStatus::Paired;
        self.reload_plugins();
    }

    /// The user rejected the peer's pair request
    pub fn reject_pairing(&mut self) {
        if self.pair_status != PairStatus::NotPaired {
            warn!("reject_pairing in state {:?}", self.pair_status);
            return;
        }

        info!("rejected pair request from {}", self.name);
        self.peer_key = None;
        self.send(PairPacket::reject());
    }

    fn pairing_timeout(&mut self) {
        if self.pair_status != PairStatus::PairRequested {
            return;
        }

        info!("pair request to {} timed out", self.name);
        self.pair_status = PairStatus::NotPaired;
        self.pairing_timer.stop();
        self.emit(DeviceSignal::PairingFailed(PairingFailure::TimedOut));
    }

    fn own_public_key(&self) -> Result<String> {
        LocalKeyPair::load_or_generate(&self.config)?.public_key_base64()
    }

    fn persist_trusted_record(&self, peer_key_encoded: &str) {
        let ns = device_ns(&self.id);
        self.config.write(&ns, "name", &self.name);
        self.config.write(&ns, "publicKey", peer_key_encoded);
    }

    // ── Plugin binding ──────────────────────────────────────────

    /// Rebuild the plugin set for the current trust and reachability state
    ///
    /// Unpaired or unreachable devices run no plugins at all. Otherwise the
    /// loader's plugin list is filtered through per-device configuration
    /// (`<name>Enabled`, falling back to the plugin's default), instances
    /// that stay enabled are kept alive, newly enabled ones are created and
    /// the rest are destroyed. Safe to call from any state transition.
    pub fn reload_plugins(&mut self) {
        let mut next: HashMap<String, Box<dyn Plugin>> = HashMap::new();

        if self.is_paired() && self.is_reachable() {
            let ns = device_plugins_ns(&self.id);
            for name in self.registry.plugin_names() {
                let enabled = match self.config.read(&ns, &format!("{name}Enabled")) {
                    Some(value) => value == "true",
                    None => self
                        .registry
                        .info(&name)
                        .map(|i| i.enabled_by_default)
                        .unwrap_or(false),
                };
                if !enabled {
                    continue;
                }

                if let Some(existing) = self.plugins.remove(&name) {
                    next.insert(name, existing);
                } else {
                    let handle = self.handle();
                    match self.registry.instantiate(&name, handle) {
                        Ok(plugin) => {
                            debug!("loaded plugin {name} for {}", self.name);
                            next.insert(name, plugin);
                        }
                        Err(e) => warn!("could not load plugin {name} for {}: {e}", self.name),
                    }
                }
            }
        }

        // Whatever is left in the old map is no longer wanted
        self.plugins = next;

        for plugin in self.plugins.values_mut() {
            plugin.connected();
        }

        self.emit(DeviceSignal::PluginsChanged {
            loaded: self.loaded_plugins(),
        });
    }
}
