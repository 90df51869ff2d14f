//! Guest Registry - process-wide map of guest id to guest
//!
//! The registry lock guards membership only. Lookups hand out `Arc<Guest>`
//! clones and release the lock before the caller touches any guest lock, so
//! the two can never deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use super::config::GuestConfig;
use super::handle::{Guest, GuestStatus};
use crate::error::{Error, Result};
use crate::store::GuestStore;

/// Longest accepted guest name
pub const MAX_NAME_LEN: usize = 32;

/// Guest names end up in file paths and nmdm device names
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Thread-safe registry of all known guests
pub struct GuestRegistry {
    guests: Mutex<HashMap<Uuid, Arc<Guest>>>,
    store: Arc<dyn GuestStore>,
}

impl GuestRegistry {
    /// Create an empty registry backed by `store`
    pub fn new(store: Arc<dyn GuestStore>) -> Self {
        Self {
            guests: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Create a registry populated from every record in `store`
    pub fn load(store: Arc<dyn GuestStore>) -> Result<Self> {
        let records = store.find_all()?;
        let registry = Self::new(store);
        {
            let mut guests = registry.guests();
            for record in records {
                debug!(guest = %record.name, status = %record.status, "loaded guest record");
                let guest = Guest::from_record(record);
                guests.insert(guest.id(), Arc::new(guest));
            }
            info!(count = guests.len(), "guest registry loaded");
        }
        Ok(registry)
    }

    fn guests(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Guest>>> {
        self.guests.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_by_id(&self, id: &Uuid) -> Option<Arc<Guest>> {
        self.guests().get(id).cloned()
    }

    /// First guest with this name
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Guest>> {
        self.guests().values().find(|g| g.name() == name).cloned()
    }

    /// Snapshot of all guests, ordered by name
    pub fn get_all(&self) -> Vec<Arc<Guest>> {
        let mut all: Vec<Arc<Guest>> = self.guests().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.guests().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register and persist a new stopped guest
    pub fn create(&self, name: &str, config: GuestConfig) -> Result<Arc<Guest>> {
        validate_name(name)?;
        let guest = Arc::new(Guest::new(name, config));

        let mut guests = self.guests();
        if guests.values().any(|g| g.name() == name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.store.create(&guest.to_record())?;
        guests.insert(guest.id(), Arc::clone(&guest));

        info!(guest = %name, id = %guest.id(), "guest created");
        Ok(guest)
    }

    /// Remove a stopped guest and its record.
    ///
    /// The guest is flagged deleted under its own lock first, so a start
    /// racing with the delete sees it as gone. If the record cannot be
    /// removed the flag is cleared and the guest stays registered.
    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let guest = self.get_by_id(id).ok_or_else(|| Error::guest_not_found(id))?;

        guest.transition(|state| {
            if state.deleted {
                return Err(Error::guest_not_found(id));
            }
            if state.status != GuestStatus::Stopped {
                return Err(Error::NotStopped(guest.name().to_string()));
            }
            state.deleted = true;
            Ok(())
        })?;

        if let Err(e) = self.store.delete(id) {
            let _ = guest.transition(|state| {
                state.deleted = false;
                Ok(())
            });
            return Err(e);
        }

        self.guests().remove(id);
        info!(guest = %guest.name(), id = %id, "guest deleted");
        Ok(())
    }

    /// Write the guest's current state to the store
    pub fn persist(&self, guest: &Guest) -> Result<()> {
        self.store.update(&guest.to_record())
    }
}
