//! Process supervision for the hypervisor launcher
//!
//! A supervisor owns one launcher process at a time and reports what
//! happens to it as [`ProcessEvent`]s. bhyve exits with status 0 when the
//! guest reboots; with restart enabled the supervisor relaunches after the
//! configured delay until it is halted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::cmdline::Invocation;
use super::config::GuestConfig;
use crate::error::{Error, Result};

/// Per-guest UEFI variable store, seeded from the firmware template
pub const UEFI_VARS_FILE: &str = "BHYVE_UEFI_VARS.fd";

/// When to relaunch an exited hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &GuestConfig) -> Self {
        Self {
            enabled: config.restart,
            delay: config.restart_delay(),
        }
    }

    /// Only a clean exit (guest reboot) is restarted
    pub fn should_restart(&self, code: Option<i32>) -> bool {
        self.enabled && code == Some(0)
    }
}

/// Things that happen to a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A launcher process is running
    Spawned { pid: u32 },
    /// The launcher exited; `code` is None when killed by a signal
    Exited { pid: u32, code: Option<i32> },
    /// The launcher could not be started at all
    SpawnFailed(String),
    /// Supervision is over; no more events follow
    Finished,
}

/// Handle to one supervised run
pub struct Supervision {
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    /// Send `true` to stop further restarts
    pub halt: watch::Sender<bool>,
}

/// Runs an invocation and reports its lifecycle
pub trait ProcessSupervisor: Send + Sync {
    fn supervise(&self, invocation: Invocation, policy: RestartPolicy) -> Supervision;
}

/// [`ProcessSupervisor`] that launches real processes with tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSupervisor;

impl ProcessSupervisor for CommandSupervisor {
    fn supervise(&self, invocation: Invocation, policy: RestartPolicy) -> Supervision {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (halt, halt_rx) = watch::channel(false);
        tokio::spawn(supervise_loop(invocation, policy, events_tx, halt_rx));
        Supervision { events, halt }
    }
}

async fn supervise_loop(
    invocation: Invocation,
    policy: RestartPolicy,
    events: mpsc::UnboundedSender<ProcessEvent>,
    mut halt: watch::Receiver<bool>,
) {
    loop {
        if *halt.borrow() {
            break;
        }

        debug!(command = %invocation, "launching hypervisor");
        let spawned = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %invocation.program.display(), error = %e, "failed to launch");
                let _ = events.send(ProcessEvent::SpawnFailed(e.to_string()));
                break;
            }
        };

        let pid = child.id().unwrap_or(0);
        let _ = events.send(ProcessEvent::Spawned { pid });

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid, error = %e, "failed waiting on launcher");
                None
            }
        };
        info!(pid, ?code, "launcher exited");
        let _ = events.send(ProcessEvent::Exited { pid, code });

        if !policy.should_restart(code) || *halt.borrow() {
            break;
        }

        info!(delay = ?policy.delay, "guest rebooted, relaunching");
        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            changed = halt.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let _ = events.send(ProcessEvent::Finished);
}

/// `<state_dir>/<name>`
pub fn guest_dir(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(name)
}

/// Path of the guest's UEFI variable store
pub fn uefi_vars_path(state_dir: &Path, name: &str) -> PathBuf {
    guest_dir(state_dir, name).join(UEFI_VARS_FILE)
}

/// Copy the vars template to `dest` unless it already exists.
///
/// Returns whether a copy was made.
pub fn prepare_uefi_vars(template: &Path, dest: &Path) -> Result<bool> {
    if dest.exists() {
        return Ok(false);
    }
    if !template.is_file() {
        return Err(Error::Config(format!(
            "UEFI vars template {} does not exist",
            template.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(template, dest)?;
    debug!(dest = %dest.display(), "seeded UEFI vars");
    Ok(true)
}
