//! Guest - one virtual machine and all of its mutable state
//!
//! Each Guest tracks one bhyve VM throughout its lifecycle:
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!
//! Two locks live inside a Guest:
//! - `state` (std mutex): status, pid, ports, console paths, config and
//!   attachment lists. Held only for short, non-async critical sections.
//! - `runtime` (tokio mutex): handles that belong to one run of the guest
//!   (supervisor halt switch, console loggers, built NIC devices).
//!
//! Lock order is always runtime -> state. The registry lock is never held
//! while either is taken.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use super::attach::AttachKind;
use super::cmdline::NicDevice;
use super::config::{GuestConfig, COM_PORTS};
use crate::console::ConsoleLogger;
use crate::error::{Error, Result};
use crate::store::GuestRecord;

/// Lifecycle status of a guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GuestStatus::Stopped => "STOPPED",
            GuestStatus::Starting => "STARTING",
            GuestStatus::Running => "RUNNING",
            GuestStatus::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Runtime view of one serial port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComState {
    /// Guest-facing device handed to bhyve; empty when stopped
    pub device: String,
    /// A console logger managed to open the host-facing end
    pub readable: bool,
    pub logging: bool,
}

/// Everything guarded by the guest lock
#[derive(Debug, Clone, PartialEq)]
pub struct GuestState {
    pub status: GuestStatus,
    /// Pid of the top-level launcher (privilege wrapper) process
    pub bhyve_pid: u32,
    pub vnc_port: u16,
    pub debug_port: u16,
    pub com: [ComState; COM_PORTS],
    pub config: GuestConfig,
    pub disks: Vec<Uuid>,
    pub isos: Vec<Uuid>,
    pub nics: Vec<Uuid>,
    pub(crate) deleted: bool,
}

impl GuestState {
    fn new(config: GuestConfig) -> Self {
        Self {
            status: GuestStatus::Stopped,
            bhyve_pid: 0,
            vnc_port: 0,
            debug_port: 0,
            com: Default::default(),
            config,
            disks: Vec::new(),
            isos: Vec::new(),
            nics: Vec::new(),
            deleted: false,
        }
    }

    pub fn attachments(&self, kind: AttachKind) -> &[Uuid] {
        match kind {
            AttachKind::Disk => &self.disks,
            AttachKind::Iso => &self.isos,
            AttachKind::Nic => &self.nics,
        }
    }

    pub(crate) fn attachments_mut(&mut self, kind: AttachKind) -> &mut Vec<Uuid> {
        match kind {
            AttachKind::Disk => &mut self.disks,
            AttachKind::Iso => &mut self.isos,
            AttachKind::Nic => &mut self.nics,
        }
    }

    fn clear_runtime(&mut self) {
        self.status = GuestStatus::Stopped;
        self.bhyve_pid = 0;
        self.vnc_port = 0;
        self.debug_port = 0;
        self.com = Default::default();
    }
}

/// Handles owned by a single run (start..stop) of a guest
#[derive(Default)]
pub(crate) struct GuestRuntime {
    /// Bumped on every start; teardown only acts on the run it belongs to
    pub run_id: u64,
    /// A supervised run is in progress
    pub active: bool,
    /// Tells the process supervisor to stop restarting
    pub halt: Option<watch::Sender<bool>>,
    /// Tells the event watcher to exit
    pub watcher_cancel: Option<oneshot::Sender<()>>,
    pub consoles: Vec<ConsoleLogger>,
    pub nic_devices: Vec<NicDevice>,
    /// Resolved bhyve pid (a descendant of the launcher)
    pub hypervisor_pid: Option<u32>,
}

/// A virtual machine managed by the supervisor
///
/// Always shared as `Arc<Guest>`; never copied.
pub struct Guest {
    id: Uuid,
    name: String,
    state: Mutex<GuestState>,
    status_tx: watch::Sender<GuestStatus>,
    pub(crate) runtime: tokio::sync::Mutex<GuestRuntime>,
}

impl Guest {
    /// Create a stopped guest with a fresh id
    pub fn new(name: impl Into<String>, config: GuestConfig) -> Self {
        Self::with_state(Uuid::now_v7(), name.into(), GuestState::new(config))
    }

    /// Rebuild a guest from its persisted record
    pub fn from_record(record: GuestRecord) -> Self {
        let state = GuestState {
            status: record.status,
            bhyve_pid: record.bhyve_pid,
            vnc_port: record.vnc_port,
            debug_port: record.debug_port,
            com: record.com,
            config: record.config,
            disks: record.disks,
            isos: record.isos,
            nics: record.nics,
            deleted: false,
        };
        Self::with_state(record.id, record.name, state)
    }

    fn with_state(id: Uuid, name: String, state: GuestState) -> Self {
        let (status_tx, _) = watch::channel(state.status);
        Self {
            id,
            name,
            state: Mutex::new(state),
            status_tx,
            runtime: tokio::sync::Mutex::new(GuestRuntime::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> GuestStatus {
        self.lock().status
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> GuestState {
        self.lock().clone()
    }

    pub fn config(&self) -> GuestConfig {
        self.lock().config.clone()
    }

    /// Receive every status transition from now on
    pub fn subscribe_status(&self) -> watch::Receiver<GuestStatus> {
        self.status_tx.subscribe()
    }

    /// Persistable form of the current state
    pub fn to_record(&self) -> GuestRecord {
        let state = self.lock();
        GuestRecord {
            id: self.id,
            name: self.name.clone(),
            status: state.status,
            bhyve_pid: state.bhyve_pid,
            vnc_port: state.vnc_port,
            debug_port: state.debug_port,
            com: state.com.clone(),
            config: state.config.clone(),
            disks: state.disks.clone(),
            isos: state.isos.clone(),
            nics: state.nics.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a read-modify-write under the guest lock and publish the new
    /// status if it changed
    pub(crate) fn transition<R>(
        &self,
        f: impl FnOnce(&mut GuestState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.lock();
        let before = state.status;
        let result = f(&mut state);
        if state.status != before {
            self.status_tx.send_replace(state.status);
        }
        result
    }

    /// STARTING -> RUNNING with the launcher pid.
    ///
    /// A respawn after a guest reboot arrives while already RUNNING and only
    /// refreshes the pid. Returns false if the guest left the run meanwhile.
    pub(crate) fn mark_running(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        self.transition(|state| match state.status {
            GuestStatus::Starting | GuestStatus::Running => {
                state.status = GuestStatus::Running;
                state.bhyve_pid = pid;
                Ok(true)
            }
            _ => Ok(false),
        })
        .unwrap_or(false)
    }

    /// RUNNING -> STOPPING; returns the pid to terminate and the per-phase wait
    pub(crate) fn begin_stop(&self) -> Result<(u32, Duration)> {
        self.transition(|state| {
            if state.deleted {
                return Err(Error::guest_not_found(self.id));
            }
            if state.status != GuestStatus::Running {
                return Err(Error::NotRunning(self.name.clone()));
            }
            state.status = GuestStatus::Stopping;
            Ok((state.bhyve_pid, state.config.max_wait()))
        })
    }

    /// Any -> STOPPED, clearing pid, ports and console paths.
    ///
    /// Never fails; returns the status the guest was in.
    pub(crate) fn mark_stopped(&self) -> GuestStatus {
        self.transition(|state| {
            let before = state.status;
            state.clear_runtime();
            Ok(before)
        })
        .unwrap_or(GuestStatus::Stopped)
    }

    pub(crate) fn set_com_readable(&self, index: usize, readable: bool) {
        let _ = self.transition(|state| {
            if let Some(com) = state.com.get_mut(index) {
                com.readable = readable;
            }
            Ok(())
        });
    }
}

impl std::fmt::Debug for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Guest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &state.status)
            .field("bhyve_pid", &state.bhyve_pid)
            .field("vnc_port", &state.vnc_port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(guest: &Guest) {
        guest
            .transition(|s| {
                s.status = GuestStatus::Starting;
                s.vnc_port = 6900;
                s.debug_port = 2828;
                s.com[0].device = "/dev/nmdm-web-com1-A".into();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_new_guest_is_stopped_and_clear() {
        let guest = Guest::new("web", GuestConfig::default());
        let state = guest.snapshot();
        assert_eq!(state.status, GuestStatus::Stopped);
        assert_eq!(state.bhyve_pid, 0);
        assert_eq!(state.vnc_port, 0);
        assert!(state.com.iter().all(|c| c.device.is_empty()));
    }

    #[test]
    fn test_mark_running_requires_starting() {
        let guest = Guest::new("web", GuestConfig::default());
        assert!(!guest.mark_running(100));
        assert_eq!(guest.status(), GuestStatus::Stopped);

        started(&guest);
        assert!(!guest.mark_running(0));
        assert!(guest.mark_running(100));
        assert_eq!(guest.snapshot().bhyve_pid, 100);

        // respawn keeps RUNNING and refreshes the pid
        assert!(guest.mark_running(200));
        assert_eq!(guest.snapshot().bhyve_pid, 200);
    }

    #[test]
    fn test_begin_stop_requires_running() {
        let guest = Guest::new("web", GuestConfig::default());
        assert!(matches!(guest.begin_stop(), Err(Error::NotRunning(_))));

        started(&guest);
        assert!(matches!(guest.begin_stop(), Err(Error::NotRunning(_))));

        guest.mark_running(100);
        let (pid, wait) = guest.begin_stop().unwrap();
        assert_eq!(pid, 100);
        assert_eq!(wait, Duration::from_secs(120));
        assert_eq!(guest.status(), GuestStatus::Stopping);
    }

    #[test]
    fn test_mark_stopped_clears_and_is_idempotent() {
        let guest = Guest::new("web", GuestConfig::default());
        started(&guest);
        guest.mark_running(100);

        assert_eq!(guest.mark_stopped(), GuestStatus::Running);
        assert_eq!(guest.mark_stopped(), GuestStatus::Stopped);

        let state = guest.snapshot();
        assert_eq!(state.status, GuestStatus::Stopped);
        assert_eq!((state.bhyve_pid, state.vnc_port, state.debug_port), (0, 0, 0));
        assert!(state.com.iter().all(|c| c.device.is_empty()));
    }

    #[test]
    fn test_status_changes_are_published() {
        let guest = Guest::new("web", GuestConfig::default());
        let mut rx = guest.subscribe_status();
        started(&guest);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), GuestStatus::Starting);

        guest.set_com_readable(0, true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_record_round_trip_keeps_identity() {
        let guest = Guest::new("db", GuestConfig::default());
        guest
            .transition(|s| {
                s.disks.push(Uuid::now_v7());
                Ok(())
            })
            .unwrap();
        let record = guest.to_record();
        let restored = Guest::from_record(record.clone());
        assert_eq!(restored.id(), guest.id());
        assert_eq!(restored.name(), "db");
        assert_eq!(restored.to_record(), record);
    }
}
