//! Port reservation for VNC and gdb stubs
//!
//! Ports are reserved under the allocator's lock and stay reserved, keyed
//! by guest id, until the guest stops. Two guests starting at the same
//! time can therefore never be handed the same port.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Reserves ports from a fixed search range
#[derive(Debug)]
pub struct PortAllocator {
    kind: &'static str,
    range: RangeInclusive<u16>,
    reserved: Mutex<BTreeMap<u16, Uuid>>,
}

impl PortAllocator {
    pub fn new(kind: &'static str, range: RangeInclusive<u16>) -> Self {
        Self {
            kind,
            range,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    fn reserved(&self) -> MutexGuard<'_, BTreeMap<u16, Uuid>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve the lowest free port for `owner`.
    ///
    /// An owner that already holds a port gets the same one back.
    pub fn reserve(&self, owner: Uuid) -> Result<u16> {
        let mut reserved = self.reserved();
        if let Some((port, _)) = reserved.iter().find(|(_, o)| **o == owner) {
            return Ok(*port);
        }
        let port = self
            .range
            .clone()
            .find(|p| !reserved.contains_key(p))
            .ok_or(Error::PortsExhausted(self.kind))?;
        reserved.insert(port, owner);
        Ok(port)
    }

    /// Release whatever `owner` holds; a no-op if nothing is held
    pub fn release(&self, owner: Uuid) {
        self.reserved().retain(|_, o| *o != owner);
    }

    /// Currently reserved ports, ascending
    pub fn in_use(&self) -> Vec<u16> {
        self.reserved().keys().copied().collect()
    }
}
