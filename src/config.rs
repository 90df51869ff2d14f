//! Daemon configuration
//!
//! Loaded once at startup from a TOML file. Every field has a default so a
//! minimal file (or none at all) yields a working FreeBSD layout.
//!
//! ```toml
//! state_dir = "/var/db/bhyvisor"
//! reconcile_interval_secs = 5
//!
//! [tools]
//! sudo = "/usr/local/bin/sudo"
//!
//! [ports]
//! vnc_first = 6900
//! vnc_last = 6999
//!
//! [[inventory.disks]]
//! id = "0190b6d2-8c1e-7c39-9a56-3f6a1b2c4d5e"
//! name = "web-root"
//! path = "/bhyve/disks/web-root.img"
//! ```

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::inventory::InventoryConfig;

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Per-guest state (console logs, UEFI variables) lives under here
    pub state_dir: PathBuf,
    /// Directory of the JSON guest record store
    pub database_dir: PathBuf,
    /// How often in-memory status is reconciled against live processes
    pub reconcile_interval_secs: u64,
    pub tools: ToolPaths,
    pub firmware: FirmwarePaths,
    pub ports: PortRanges,
    pub logging: LoggingConfig,
    pub inventory: InventoryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/db/bhyvisor/state"),
            database_dir: PathBuf::from("/var/db/bhyvisor/guests"),
            reconcile_interval_secs: 5,
            tools: ToolPaths::default(),
            firmware: FirmwarePaths::default(),
            ports: PortRanges::default(),
            logging: LoggingConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: DaemonConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.ports.validate()?;
        Ok(config)
    }
}

/// Paths of the host tools the supervisor shells out to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Privilege escalation wrapper; empty disables it
    pub sudo: PathBuf,
    /// Sandboxing wrapper run ahead of bhyve (`protect -i`); empty disables it
    pub protect: PathBuf,
    pub bhyve: PathBuf,
    pub bhyvectl: PathBuf,
    pub rctl: PathBuf,
    pub kill: PathBuf,
    pub pgrep: PathBuf,
    pub ps: PathBuf,
    pub renice: PathBuf,
    pub ifconfig: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            sudo: PathBuf::from("/usr/local/bin/sudo"),
            protect: PathBuf::from("/usr/bin/protect"),
            bhyve: PathBuf::from("/usr/sbin/bhyve"),
            bhyvectl: PathBuf::from("/usr/sbin/bhyvectl"),
            rctl: PathBuf::from("/usr/bin/rctl"),
            kill: PathBuf::from("/bin/kill"),
            pgrep: PathBuf::from("/bin/pgrep"),
            ps: PathBuf::from("/bin/ps"),
            renice: PathBuf::from("/usr/bin/renice"),
            ifconfig: PathBuf::from("/sbin/ifconfig"),
        }
    }
}

impl ToolPaths {
    pub fn sudo(&self) -> Option<&Path> {
        non_empty(&self.sudo)
    }

    pub fn protect(&self) -> Option<&Path> {
        non_empty(&self.protect)
    }

    /// Wrap `tool args..` in the privilege wrapper when one is configured
    pub fn privileged(&self, tool: &Path, args: Vec<String>) -> (PathBuf, Vec<String>) {
        match self.sudo() {
            Some(sudo) => {
                let mut wrapped = Vec::with_capacity(args.len() + 1);
                wrapped.push(tool.display().to_string());
                wrapped.extend(args);
                (sudo.to_path_buf(), wrapped)
            }
            None => (tool.to_path_buf(), args),
        }
    }

    /// Process name bhyve shows up as in the process table
    pub fn hypervisor_name(&self) -> String {
        self.bhyve
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bhyve".to_string())
    }
}

fn non_empty(path: &Path) -> Option<&Path> {
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

/// UEFI firmware image and the template its variable store is seeded from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwarePaths {
    pub rom: PathBuf,
    pub vars_template: PathBuf,
}

impl Default for FirmwarePaths {
    fn default() -> Self {
        Self {
            rom: PathBuf::from("/usr/local/share/uefi-firmware/BHYVE_UEFI.fd"),
            vars_template: PathBuf::from("/usr/local/share/uefi-firmware/BHYVE_UEFI_VARS.fd"),
        }
    }
}

/// Search ranges for VNC and gdb debug ports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRanges {
    pub vnc_first: u16,
    pub vnc_last: u16,
    pub debug_first: u16,
    pub debug_last: u16,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            vnc_first: 6900,
            vnc_last: 6999,
            debug_first: 2828,
            debug_last: 2927,
        }
    }
}

impl PortRanges {
    pub fn vnc(&self) -> RangeInclusive<u16> {
        self.vnc_first..=self.vnc_last
    }

    pub fn debug(&self) -> RangeInclusive<u16> {
        self.debug_first..=self.debug_last
    }

    fn validate(&self) -> Result<()> {
        if self.vnc_first == 0 || self.vnc_first > self.vnc_last {
            return Err(Error::Config(format!(
                "invalid vnc port range {}..={}",
                self.vnc_first, self.vnc_last
            )));
        }
        if self.debug_first == 0 || self.debug_first > self.debug_last {
            return Err(Error::Config(format!(
                "invalid debug port range {}..={}",
                self.debug_first, self.debug_last
            )));
        }
        Ok(())
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,bhyvisor=debug".to_string(),
            json: false,
        }
    }
}
