//! Persistent guest records
//!
//! The registry keeps the authoritative in-memory view; the store mirrors it
//! so guests survive daemon restarts. Any backend with Create/Find/Update/
//! Delete fits behind [`GuestStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::vm::config::{GuestConfig, COM_PORTS};
use crate::vm::handle::{ComState, GuestStatus};

/// A saved guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub id: Uuid,
    pub name: String,
    pub status: GuestStatus,
    pub bhyve_pid: u32,
    pub vnc_port: u16,
    pub debug_port: u16,
    pub com: [ComState; COM_PORTS],
    pub config: GuestConfig,
    pub disks: Vec<Uuid>,
    pub isos: Vec<Uuid>,
    pub nics: Vec<Uuid>,
}

/// Record storage used by the registry
pub trait GuestStore: Send + Sync {
    fn create(&self, record: &GuestRecord) -> Result<()>;
    fn update(&self, record: &GuestRecord) -> Result<()>;
    fn delete(&self, id: &Uuid) -> Result<()>;
    fn find(&self, id: &Uuid) -> Result<Option<GuestRecord>>;
    fn find_all(&self) -> Result<Vec<GuestRecord>>;
}

/// One pretty-printed JSON file per guest: `<base_dir>/<id>.json`
pub struct JsonFileStore {
    base_dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store, creating its directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(Error::persistence)?;
        Ok(Self { base_dir })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    fn write(&self, record: &GuestRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record).map_err(Error::persistence)?;
        // write-then-rename so a crash never leaves a truncated record
        let tmp = self.base_dir.join(format!(".{}.json.tmp", record.id));
        std::fs::write(&tmp, json).map_err(Error::persistence)?;
        std::fs::rename(&tmp, self.record_path(&record.id)).map_err(Error::persistence)
    }

    fn load_from_path(&self, path: &Path) -> Result<GuestRecord> {
        let json = std::fs::read_to_string(path).map_err(Error::persistence)?;
        serde_json::from_str(&json).map_err(Error::persistence)
    }
}

impl GuestStore for JsonFileStore {
    fn create(&self, record: &GuestRecord) -> Result<()> {
        if self.record_path(&record.id).exists() {
            return Err(Error::InternalPersistence(format!(
                "record {} already exists",
                record.id
            )));
        }
        self.write(record)
    }

    fn update(&self, record: &GuestRecord) -> Result<()> {
        self.write(record)
    }

    fn delete(&self, id: &Uuid) -> Result<()> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::persistence(e)),
        }
    }

    fn find(&self, id: &Uuid) -> Result<Option<GuestRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.load_from_path(&path).map(Some)
    }

    fn find_all(&self) -> Result<Vec<GuestRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir).map_err(Error::persistence)? {
            let path = entry.map_err(Error::persistence)?.path();
            let is_record = path.extension().map(|e| e == "json").unwrap_or(false)
                && !path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false);
            if !is_record {
                continue;
            }
            match self.load_from_path(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable guest record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// Volatile store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, GuestRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, GuestRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GuestStore for MemoryStore {
    fn create(&self, record: &GuestRecord) -> Result<()> {
        let mut records = self.records();
        if records.contains_key(&record.id) {
            return Err(Error::InternalPersistence(format!(
                "record {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, record: &GuestRecord) -> Result<()> {
        self.records().insert(record.id, record.clone());
        Ok(())
    }

    fn delete(&self, id: &Uuid) -> Result<()> {
        self.records().remove(id);
        Ok(())
    }

    fn find(&self, id: &Uuid) -> Result<Option<GuestRecord>> {
        Ok(self.records().get(id).cloned())
    }

    fn find_all(&self) -> Result<Vec<GuestRecord>> {
        let mut records: Vec<GuestRecord> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}
