//! Configuration storage
//!
//! The core never touches the filesystem directly; everything goes through
//! the [`ConfigStore`] seam. Values live in flat string namespaces:
//!
//! - `devices/<id>` with keys `name` and `publicKey` (one namespace per
//!   paired device)
//! - `devices/<id>/Plugins` with keys `<plugin>Enabled`
//! - `myself` with keys `publicKey` and `privateKey`
//!
//! [`FileConfig`] keeps the whole store in one JSON document and replaces it
//! atomically on every write, so a concurrent reader never observes a
//! half-written record. Tests substitute [`MemoryConfig`].

use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Namespace holding the local identity keypair
pub const MYSELF_NS: &str = "myself";

/// Namespace holding the persisted record of one device
pub fn device_ns(device_id: &str) -> String {
    format!("devices/{device_id}")
}

/// Namespace holding one device's plugin enablement flags
pub fn device_plugins_ns(device_id: &str) -> String {
    format!("devices/{device_id}/Plugins")
}

/// Key-value configuration store, namespaced per device
pub trait ConfigStore: Send {
    /// Read one value
    fn read(&self, ns: &str, key: &str) -> Option<String>;

    /// Write one value, creating the namespace if needed
    fn write(&mut self, ns: &str, key: &str, value: &str);

    /// Drop a whole namespace and everything in it
    fn delete(&mut self, ns: &str);
}

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryConfig {
    entries: HashMap<String, BTreeMap<String, String>>,
}

impl ConfigStore for MemoryConfig {
    fn read(&self, ns: &str, key: &str) -> Option<String> {
        self.entries.get(ns).and_then(|m| m.get(key)).cloned()
    }

    fn write(&mut self, ns: &str, key: &str, value: &str) {
        self.entries
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    fn delete(&mut self, ns: &str) {
        self.entries.remove(ns);
    }
}

/// JSON-file-backed store
///
/// The file maps namespace to key/value object. Writes land in a sibling
/// temporary file first and are renamed over the target, which is atomic on
/// the filesystems we care about.
pub struct FileConfig {
    path: PathBuf,
    entries: HashMap<String, BTreeMap<String, String>>,
}

impl FileConfig {
    /// Open or create the store at the given path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            HashMap::new()
        };

        info!("opened configuration store at {:?}", path);
        Ok(Self { path, entries })
    }

    fn persist(&self) {
        let json = match serde_json::to_string_pretty(&self.entries) {
            Ok(json) => json,
            Err(e) => {
                error!("could not encode configuration: {e}");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        let result = fs::write(&tmp, json).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            error!("could not persist configuration to {:?}: {e}", self.path);
        } else {
            debug!("persisted configuration to {:?}", self.path);
        }
    }
}

impl ConfigStore for FileConfig {
    fn read(&self, ns: &str, key: &str) -> Option<String> {
        self.entries.get(ns).and_then(|m| m.get(key)).cloned()
    }

    fn write(&mut self, ns: &str, key: &str, value: &str) {
        self.entries
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.persist();
    }

    fn delete(&mut self, ns: &str) {
        if self.entries.remove(ns).is_some() {
            self.persist();
        }
    }
}

/// Cloneable handle to the store shared by all devices
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<Mutex<Box<dyn ConfigStore>>>,
}

impl ConfigHandle {
    pub fn new(store: impl ConfigStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn ConfigStore>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read(&self, ns: &str, key: &str) -> Option<String> {
        self.lock().read(ns, key)
    }

    pub fn write(&self, ns: &str, key: &str, value: &str) {
        self.lock().write(ns, key, value);
    }

    pub fn delete(&self, ns: &str) {
        self.lock().delete(ns);
    }
}
