//! External command execution
//!
//! Every host tool the supervisor drives (`rctl`, `kill`, `pgrep`, `ps`,
//! `ifconfig`, `bhyvectl`) goes through a [`CommandRunner`] so tests can
//! record invocations instead of touching the host.

use std::path::Path;
use std::process::{Command, Stdio};

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Build a successful output carrying `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Build a failed output carrying `stderr`
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a program to completion and captures its output.
///
/// Implementations block; callers on the async runtime wrap calls in
/// `tokio::task::spawn_blocking`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
