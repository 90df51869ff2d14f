//! Escalating termination of a guest's process
//!
//! ```text
//! kill <pid> ──► poll every 10ms up to max_wait ──► gone? done
//!                                                    │
//!                                                    ▼
//!            kill -9 <pid> ──► poll up to max_wait ──► gone? done
//!                                                    │
//!                                                    ▼
//!                                             "refused to die"
//! ```
//!
//! Never fails: a guest must always be able to reach STOPPED, so the
//! outcome is reported, not raised.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::ToolPaths;
use crate::exec::CommandRunner;
use crate::metrics::{FORCED_KILLS_TOTAL, REFUSED_TERMINATIONS_TOTAL};

/// Existence polling interval
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sends termination signals and checks process existence
pub trait Signaller: Send + Sync {
    /// Graceful (SIGTERM) or forced (SIGKILL) termination request
    fn signal(&self, pid: u32, forced: bool) -> std::io::Result<()>;
    fn exists(&self, pid: u32) -> bool;
}

/// How a termination sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Process was not there to begin with
    AlreadyGone,
    /// Exited after the graceful signal
    Graceful,
    /// Exited after the forced signal
    Forced,
    /// Survived both phases
    Refused,
}

/// Run the two-phase escalation against `pid`
pub async fn terminate(signaller: Arc<dyn Signaller>, pid: u32, max_wait: Duration) -> Termination {
    if pid == 0 || !signaller.exists(pid) {
        debug!(pid, "process already gone");
        return Termination::AlreadyGone;
    }

    for forced in [false, true] {
        if forced {
            warn!(pid, ?max_wait, "process ignored graceful termination, escalating");
            FORCED_KILLS_TOTAL.inc();
        }

        let sender = Arc::clone(&signaller);
        let sent = tokio::task::spawn_blocking(move || sender.signal(pid, forced)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(pid, forced, error = %e, "failed to signal process"),
            Err(e) => warn!(pid, forced, error = %e, "signal task failed"),
        }

        if wait_gone(signaller.as_ref(), pid, max_wait).await {
            let outcome = if forced {
                Termination::Forced
            } else {
                Termination::Graceful
            };
            info!(pid, ?outcome, "process terminated");
            return outcome;
        }
    }

    error!(pid, "process refused to die");
    REFUSED_TERMINATIONS_TOTAL.inc();
    Termination::Refused
}

async fn wait_gone(signaller: &dyn Signaller, pid: u32, max_wait: Duration) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        if !signaller.exists(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// [`Signaller`] that shells out to `kill` (through sudo, since bhyve runs
/// as root) and probes existence with signal 0
pub struct HostSignaller {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl HostSignaller {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    fn kill_tool(&self) -> &Path {
        &self.tools.kill
    }
}

impl Signaller for HostSignaller {
    fn signal(&self, pid: u32, forced: bool) -> std::io::Result<()> {
        let mut args = Vec::with_capacity(2);
        if forced {
            args.push("-9".to_string());
        }
        args.push(pid.to_string());

        let (program, args) = self.tools.privileged(self.kill_tool(), args);
        let output = self.runner.run(&program, &args)?;
        if output.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("kill exited with {:?}: {}", output.status, output.stderr.trim()),
            ))
        }
    }

    fn exists(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // owned by root, but alive
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
