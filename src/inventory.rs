//! Disk, ISO and NIC lookups
//!
//! Disks, ISOs and NICs have their own lifecycle outside the supervisor;
//! guests only hold their ids. Lookups follow the owning subsystem's
//! contract: an entity with an empty `name` means "not found".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Emulated storage controller for a disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskDevType {
    #[default]
    Nvme,
    AhciHd,
    VirtioBlk,
}

impl DiskDevType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskDevType::Nvme => "nvme",
            DiskDevType::AhciHd => "ahci-hd",
            DiskDevType::VirtioBlk => "virtio-blk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskInfo {
    pub name: String,
    pub path: PathBuf,
    pub dev_type: DiskDevType,
    /// Host page cache enabled; `false` adds `nocache`
    pub cache: bool,
    /// Synchronous writes (`direct`)
    pub direct: bool,
}

impl Default for DiskInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: PathBuf::new(),
            dev_type: DiskDevType::default(),
            cache: true,
            direct: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoInfo {
    pub name: String,
    pub path: PathBuf,
}

/// Emulated network adapter model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NicDevType {
    #[default]
    VirtioNet,
    E1000,
}

impl NicDevType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicDevType::VirtioNet => "virtio-net",
            NicDevType::E1000 => "e1000",
        }
    }
}

/// Host-side backend device family for a NIC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    #[default]
    Tap,
    Vmnet,
}

impl NetType {
    /// Interface name prefix (`tap0`, `vmnet3`, ...)
    pub fn device_prefix(&self) -> &'static str {
        match self {
            NetType::Tap => "tap",
            NetType::Vmnet => "vmnet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicInfo {
    pub name: String,
    pub dev_type: NicDevType,
    pub net_type: NetType,
    /// Fixed MAC address, or `AUTO` to let bhyve derive one
    pub mac: String,
    /// Bridge the backend device is added to; empty leaves it unconnected
    pub switch: String,
}

impl Default for NicInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            dev_type: NicDevType::default(),
            net_type: NetType::default(),
            mac: "AUTO".to_string(),
            switch: String::new(),
        }
    }
}

/// Lookup contract of the disk/ISO/NIC subsystems.
///
/// A missing entity is returned as a default value with an empty name;
/// `Err` is reserved for storage failures.
pub trait Inventory: Send + Sync {
    fn disk(&self, id: &Uuid) -> Result<DiskInfo>;
    fn iso(&self, id: &Uuid) -> Result<IsoInfo>;
    fn nic(&self, id: &Uuid) -> Result<NicInfo>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub id: Uuid,
    #[serde(flatten)]
    pub info: DiskInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoEntry {
    pub id: Uuid,
    #[serde(flatten)]
    pub info: IsoInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicEntry {
    pub id: Uuid,
    #[serde(flatten)]
    pub info: NicInfo,
}

/// `[inventory]` section of the daemon config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub disks: Vec<DiskEntry>,
    pub isos: Vec<IsoEntry>,
    pub nics: Vec<NicEntry>,
}

/// In-memory inventory, seeded from config
#[derive(Debug, Default)]
pub struct StaticInventory {
    disks: RwLock<HashMap<Uuid, DiskInfo>>,
    isos: RwLock<HashMap<Uuid, IsoInfo>>,
    nics: RwLock<HashMap<Uuid, NicInfo>>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &InventoryConfig) -> Self {
        let inventory = Self::new();
        for entry in &config.disks {
            inventory.insert_disk(entry.id, entry.info.clone());
        }
        for entry in &config.isos {
            inventory.insert_iso(entry.id, entry.info.clone());
        }
        for entry in &config.nics {
            inventory.insert_nic(entry.id, entry.info.clone());
        }
        inventory
    }

    pub fn insert_disk(&self, id: Uuid, info: DiskInfo) {
        write(&self.disks).insert(id, info);
    }

    pub fn insert_iso(&self, id: Uuid, info: IsoInfo) {
        write(&self.isos).insert(id, info);
    }

    pub fn insert_nic(&self, id: Uuid, info: NicInfo) {
        write(&self.nics).insert(id, info);
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

impl Inventory for StaticInventory {
    fn disk(&self, id: &Uuid) -> Result<DiskInfo> {
        Ok(read(&self.disks).get(id).cloned().unwrap_or_default())
    }

    fn iso(&self, id: &Uuid) -> Result<IsoInfo> {
        Ok(read(&self.isos).get(id).cloned().unwrap_or_default())
    }

    fn nic(&self, id: &Uuid) -> Result<NicInfo> {
        Ok(read(&self.nics).get(id).cloned().unwrap_or_default())
    }
}
