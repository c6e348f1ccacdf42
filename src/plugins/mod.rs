//! Plugin architecture
//!
//! Features are packaged as plugins bound per device. A plugin only runs
//! while its device is paired and reachable; the device loads and unloads
//! instances as that condition changes, preserving instances (and their
//! state) across reloads.
//!
//! Factories describe a plugin (name, default enablement, description) and
//! mint one instance per device. The [`PluginRegistry`] is the loader the
//! device consults: it enumerates the configured factories and instantiates
//! plugins on demand.
//!
//! Every instance sees every packet forwarded to its device and reports
//! whether it consumed it. Instances talk back through the
//! [`DeviceHandle`] they were constructed with; packets sent through the
//! handle are routed, sealed and dispatched by the owning device.

pub mod ping;

use crate::device::DeviceHandle;
use crate::packet::NetworkPacket;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A feature handler bound to one device
///
/// Callbacks run on the device's event loop; they must not block. An
/// instance can be dropped at any point outside a `receive` call and must
/// not assume its device outlives it.
pub trait Plugin: Send {
    /// Short lowercase identifier, unique among plugins
    fn name(&self) -> &str;

    /// Handle a packet forwarded by the device
    ///
    /// Returns `true` when this plugin consumed the packet. Unknown packet
    /// types must be left alone by returning `false`.
    fn receive(&mut self, packet: &NetworkPacket) -> bool;

    /// Called on every fresh link-up of the device, including
    /// reload-driven reconnections
    ///
    /// A plugin that mirrors state to the peer resends it here, so a new
    /// transport starts from a consistent picture.
    fn connected(&mut self);
}

/// Factory minting per-device instances of one plugin
pub trait PluginFactory: Send + Sync {
    /// The plugin name this factory creates
    fn name(&self) -> &str;

    /// Whether the plugin runs when per-device configuration says nothing
    fn enabled_by_default(&self) -> bool {
        true
    }

    /// One-line description for settings UIs
    fn description(&self) -> &str {
        ""
    }

    /// Create a new instance for the device behind `handle`
    fn create(&self, handle: DeviceHandle) -> Box<dyn Plugin>;
}

/// Static description of a registered plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub enabled_by_default: bool,
    pub description: String,
}

/// The plugin loader
///
/// Holds the registered factories. Shared read-only across devices.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in plugins registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(ping::PingPluginFactory))
            .expect("built-in plugins have unique names");
        registry
    }

    /// Register a plugin factory
    ///
    /// Fails when a factory with the same name is already registered.
    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.name().to_string();
        if self.factories.contains_key(&name) {
            return Err(Error::Plugin(format!(
                "plugin '{name}' is already registered"
            )));
        }

        info!("registered plugin: {name}");
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Names of all registered plugins, in deterministic order
    pub fn plugin_names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Describe one plugin
    pub fn info(&self, name: &str) -> Option<PluginInfo> {
        self.factories.get(name).map(|f| PluginInfo {
            name: f.name().to_string(),
            enabled_by_default: f.enabled_by_default(),
            description: f.description().to_string(),
        })
    }

    /// Mint an instance of `name` for the device behind `handle`
    pub fn instantiate(&self, name: &str, handle: DeviceHandle) -> Result<Box<dyn Plugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::Plugin(format!("unknown plugin '{name}'")))?;
        Ok(factory.create(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct NullPlugin;

    impl Plugin for NullPlugin {
        fn name(&self) -> &str {
            "null"
        }

        fn receive(&mut self, _packet: &NetworkPacket) -> bool {
            false
        }

        fn connected(&mut self) {}
    }

    struct NullFactory {
        default: bool,
    }

    impl PluginFactory for NullFactory {
        fn name(&self) -> &str {
            "null"
        }

        fn enabled_by_default(&self) -> bool {
            self.default
        }

        fn description(&self) -> &str {
            "does nothing"
        }

        fn create(&self, _handle: DeviceHandle) -> Box<dyn Plugin> {
            Box::new(NullPlugin)
        }
    }

    fn test_handle() -> DeviceHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        DeviceHandle::new("test_device".to_string(), "Test Device".to_string(), tx)
    }

    #[test]
    fn test_register_and_describe() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(NullFactory { default: false }))
            .unwrap();

        assert_eq!(registry.plugin_names(), vec!["null".to_string()]);

        let info = registry.info("null").unwrap();
        assert_eq!(info.name, "null");
        assert!(!info.enabled_by_default);
        assert_eq!(info.description, "does nothing");

        assert!(registry.info("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(NullFactory { default: true }))
            .unwrap();
        assert!(registry
            .register(Arc::new(NullFactory { default: true }))
            .is_err());
    }

    #[test]
    fn test_instantiate() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(NullFactory { default: true }))
            .unwrap();

        let plugin = registry.instantiate("null", test_handle()).unwrap();
        assert_eq!(plugin.name(), "null");

        assert!(registry.instantiate("missing", test_handle()).is_err());
    }

    #[test]
    fn test_default_registry_has_ping() {
        let registry = PluginRegistry::with_defaults();
        assert!(registry.plugin_names().contains(&"ping".to_string()));
        assert!(registry.info("ping").unwrap().enabled_by_default);
    }

    #[test]
    fn test_names_are_sorted() {
        struct Named(&'static str);
        impl PluginFactory for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn create(&self, _handle: DeviceHandle) -> Box<dyn Plugin> {
                Box::new(NullPlugin)
            }
        }

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("zebra"))).unwrap();
        registry.register(Arc::new(Named("alpha"))).unwrap();

        assert_eq!(registry.plugin_names(), vec!["alpha", "zebra"]);
    }
}
