//! Durable registry of per-interface configuration.
//!
//! Every interface the enumerator has ever observed gets a record here,
//! created disabled and filled in once a provisioning session completes.
//! Records are never deleted; pruning interfaces that have vanished from the
//! kernel is out of scope.
//!
//! The registry is a TOML file on disk.  Each operation is a single
//! load-mutate-save cycle serialized behind a process-wide lock, so two
//! sessions provisioning different interfaces cannot corrupt each other's
//! records.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

lazy_static! {
    static ref REGISTRY_LOCK: Mutex<()> = Mutex::new(());
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirelessRecord {
    /// Kernel name of the radio interface participating in the mesh.
    pub mesh_interface: String,
    /// Virtual sub-interface serving clients, e.g. `wlan0:1`.
    pub client_interface: String,
    pub enabled: bool,
    pub channel: u8,
    pub essid: String,
    pub gateway: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WiredRecord {
    pub interface: String,
    pub enabled: bool,
    /// Whether this interface is the node's uplink.
    pub gateway: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryData {
    #[serde(default)]
    wireless: Vec<WirelessRecord>,
    #[serde(default)]
    wired: Vec<WiredRecord>,
}

/// Handle on the registry file.  Cheap to construct; all state lives on disk.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryData> {
        if !self.path.exists() {
            return Ok(RegistryData::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read registry: {}", self.path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse registry: {}", self.path.display()))
    }

    fn save(&self, data: &RegistryData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(data).context("Failed to serialize registry")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write registry: {}", self.path.display()))?;
        Ok(())
    }

    pub fn lookup_wireless(&self, name: &str) -> Result<Option<WirelessRecord>> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        let data = self.load()?;
        Ok(data
            .wireless
            .iter()
            .find(|r| r.mesh_interface == name)
            .cloned())
    }

    pub fn lookup_wired(&self, name: &str) -> Result<Option<WiredRecord>> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        let data = self.load()?;
        Ok(data.wired.iter().find(|r| r.interface == name).cloned())
    }

    pub fn all_wireless(&self) -> Result<Vec<WirelessRecord>> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        Ok(self.load()?.wireless)
    }

    pub fn all_wired(&self) -> Result<Vec<WiredRecord>> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        Ok(self.load()?.wired)
    }

    /// Create a disabled record for a newly observed wireless interface.
    /// A no-op if a record for the interface already exists.
    pub fn insert_wireless(&self, name: &str) -> Result<()> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        let mut data = self.load()?;
        if data.wireless.iter().any(|r| r.mesh_interface == name) {
            return Ok(());
        }
        debug!("Registering wireless interface {}", name);
        data.wireless.push(WirelessRecord {
            mesh_interface: name.to_string(),
            client_interface: format!("{}:1", name),
            enabled: false,
            channel: 0,
            essid: String::new(),
            gateway: false,
        });
        self.save(&data)
    }

    /// Create a disabled record for a newly observed wired interface.
    pub fn insert_wired(&self, name: &str) -> Result<()> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        let mut data = self.load()?;
        if data.wired.iter().any(|r| r.interface == name) {
            return Ok(());
        }
        debug!("Registering wired interface {}", name);
        data.wired.push(WiredRecord {
            interface: name.to_string(),
            enabled: false,
            gateway: false,
        });
        self.save(&data)
    }

    /// Register every enumerated interface that has no record yet.  Returns
    /// the number of records created.
    pub fn register_missing(&self, wired: &[String], wireless: &[String]) -> Result<usize> {
        let mut created = 0;
        for name in wireless {
            if self.lookup_wireless(name)?.is_none() {
                self.insert_wireless(name)?;
                created += 1;
            }
        }
        for name in wired {
            if self.lookup_wired(name)?.is_none() {
                self.insert_wired(name)?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Record a completed provisioning run: store the wireless parameters and
    /// flip the record to enabled in one write.
    pub fn mark_configured(
        &self,
        name: &str,
        channel: u8,
        essid: &str,
        client_interface: &str,
    ) -> Result<()> {
        let _guard = REGISTRY_LOCK.lock().unwrap();
        let mut data = self.load()?;
        match data.wireless.iter_mut().find(|r| r.mesh_interface == name) {
            Some(record) => {
                record.enabled = true;
                record.channel = channel;
                record.essid = essid.to_string();
                record.client_interface = client_interface.to_string();
            }
            None => {
                data.wireless.push(WirelessRecord {
                    mesh_interface: name.to_string(),
                    client_interface: client_interface.to_string(),
                    enabled: true,
                    channel,
                    essid: essid.to_string(),
                    gateway: false,
                });
            }
        }
        debug!("Marked {} configured (channel {}, essid {})", name, channel, essid);
        self.save(&data)
    }
}
