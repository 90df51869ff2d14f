//! Finding the real bhyve process
//!
//! The supervised process is the privilege wrapper, not bhyve itself:
//!
//! ```text
//! sudo (launcher pid) ── protect ── bhyve   ← rctl rules go here
//! ```
//!
//! We walk down the first-child chain until a process named like the
//! hypervisor binary shows up, giving up after [`MAX_SEARCH_DEPTH`] hops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::exec::CommandRunner;

/// How many parent -> child hops to follow before giving up
pub const MAX_SEARCH_DEPTH: usize = 8;

/// Narrow view of the host process table
pub trait ProcessTree: Send + Sync {
    /// First child of `pid`, if any
    fn find_child(&self, pid: u32) -> Option<u32>;
    /// Short process name of `pid`
    fn process_name(&self, pid: u32) -> Option<String>;
}

/// Walk from `root` to the first descendant named `binary`
pub fn find_hypervisor_pid(tree: &dyn ProcessTree, root: u32, binary: &str) -> Option<u32> {
    let mut pid = root;
    for depth in 0..MAX_SEARCH_DEPTH {
        let name = tree.process_name(pid);
        debug!(pid, depth, name = ?name, "walking process tree");
        if name.as_deref() == Some(binary) {
            return Some(pid);
        }
        pid = tree.find_child(pid)?;
    }
    None
}

#[derive(Debug, Deserialize)]
struct PsOutput {
    #[serde(rename = "process-information")]
    process_information: ProcessInformation,
}

#[derive(Debug, Deserialize)]
struct ProcessInformation {
    #[serde(default)]
    process: Vec<PsProcess>,
}

#[derive(Debug, Deserialize)]
struct PsProcess {
    command: String,
}

/// Extract a process name from `ps --libxo json` output.
///
/// The first token of the command is used; bhyve retitles itself to
/// `bhyve: <vm>` so a trailing colon is dropped, and a path is reduced to
/// its file name.
pub fn parse_ps_json(json: &str) -> Option<String> {
    let parsed: PsOutput = serde_json::from_str(json).ok()?;
    let command = parsed.process_information.process.into_iter().next()?.command;
    let first = command.split_whitespace().next()?;
    let first = first.trim_end_matches(':');
    let name = Path::new(first).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// [`ProcessTree`] backed by `pgrep -P` and `ps --libxo json`
pub struct HostProcessTree {
    runner: Arc<dyn CommandRunner>,
    pgrep: PathBuf,
    ps: PathBuf,
}

impl HostProcessTree {
    pub fn new(runner: Arc<dyn CommandRunner>, pgrep: PathBuf, ps: PathBuf) -> Self {
        Self { runner, pgrep, ps }
    }
}

impl ProcessTree for HostProcessTree {
    fn find_child(&self, pid: u32) -> Option<u32> {
        let output = self
            .runner
            .run(&self.pgrep, &["-P".to_string(), pid.to_string()])
            .ok()?;
        if !output.success() {
            return None;
        }
        output
            .stdout
            .lines()
            .find_map(|line| line.trim().parse::<u32>().ok())
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let args = [
            "--libxo".to_string(),
            "json".to_string(),
            "-p".to_string(),
            pid.to_string(),
        ];
        let output = self.runner.run(&self.ps, &args).ok()?;
        if !output.success() {
            return None;
        }
        parse_ps_json(&output.stdout)
    }
}
