//! rctl(8) resource limits for bhyve processes
//!
//! Each running guest's hypervisor process gets a set of per-process rules:
//!
//! ```text
//! rctl -a process:<pid>:pcpu:deny=<percent>        ← CPU cap (100 = one core)
//! rctl -a process:<pid>:readbps:throttle=<bytes>   ← block read bandwidth
//! rctl -a process:<pid>:writebps:throttle=<bytes>  ← block write bandwidth
//! rctl -a process:<pid>:readiops:throttle=<ops>    ← block read IOPS
//! rctl -a process:<pid>:writeiops:throttle=<ops>   ← block write IOPS
//! ```
//!
//! Only limits with a value above zero produce a rule. Rules are applied
//! independently: one rejected rule is logged and the others still go in,
//! since a guest that cannot be throttled still runs.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ToolPaths;
use crate::exec::CommandRunner;

/// Resource limits for a guest; zero means unlimited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU percentage cap (100 = one full core)
    pub pcpu: u32,
    /// Read bytes per second
    pub read_bps: u64,
    /// Write bytes per second
    pub write_bps: u64,
    /// Read operations per second
    pub read_iops: u64,
    /// Write operations per second
    pub write_iops: u64,
}

impl ResourceLimits {
    /// True when no limit is set
    pub fn is_unlimited(&self) -> bool {
        self.rules_for(0).is_empty()
    }

    /// rctl rules for `pid`, in the order they are applied
    pub fn rules_for(&self, pid: u32) -> Vec<String> {
        let candidates: [(&str, &str, u64); 5] = [
            ("pcpu", "deny", u64::from(self.pcpu)),
            ("readbps", "throttle", self.read_bps),
            ("writebps", "throttle", self.write_bps),
            ("readiops", "throttle", self.read_iops),
            ("writeiops", "throttle", self.write_iops),
        ];

        candidates
            .iter()
            .filter(|(_, _, value)| *value > 0)
            .map(|(resource, action, value)| {
                format!("process:{}:{}:{}={}", pid, resource, action, value)
            })
            .collect()
    }
}

/// Applies and removes rctl rules for hypervisor processes
///
/// # Example
///
/// ```ignore
/// let rctl = RctlManager::new(runner, tools);
///
/// // Once the real bhyve pid is known
/// rctl.apply(bhyve_pid, &config.limits);
///
/// // On teardown
/// rctl.clear(bhyve_pid);
/// ```
pub struct RctlManager {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl RctlManager {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    /// Apply every non-zero limit to `pid`; returns how many rules took effect
    pub fn apply(&self, pid: u32, limits: &ResourceLimits) -> usize {
        let mut applied = 0;
        for rule in limits.rules_for(pid) {
            if self.run_rctl(vec!["-a".to_string(), rule.clone()]) {
                debug!(pid, rule = %rule, "rctl rule added");
                applied += 1;
            }
        }
        if applied > 0 {
            info!(pid, applied, "resource limits applied");
        }
        applied
    }

    /// Remove every rule on `pid`
    pub fn clear(&self, pid: u32) {
        self.run_rctl(vec!["-r".to_string(), format!("process:{}", pid)]);
    }

    /// Renice `pid`; a zero priority is left alone
    pub fn apply_priority(&self, pid: u32, priority: i32) -> bool {
        if priority == 0 {
            return false;
        }
        let args = vec![
            "-n".to_string(),
            priority.to_string(),
            "-p".to_string(),
            pid.to_string(),
        ];
        self.run_privileged(&self.tools.renice, args)
    }

    fn run_rctl(&self, args: Vec<String>) -> bool {
        self.run_privileged(&self.tools.rctl, args)
    }

    fn run_privileged(&self, tool: &Path, args: Vec<String>) -> bool {
        let (program, args) = self.tools.privileged(tool, args);
        match self.runner.run(&program, &args) {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    tool = %tool.display(),
                    args = ?args,
                    status = ?output.status,
                    stderr = %output.stderr.trim(),
                    "resource control command failed"
                );
                false
            }
            Err(e) => {
                warn!(tool = %tool.display(), error = %e, "failed to run resource control command");
                false
            }
        }
    }
}
