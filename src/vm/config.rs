//! Guest configuration
//!
//! One `GuestConfig` per guest, created alongside it and persisted in its
//! record. Everything the command-line builder, console loggers and resource
//! limiter need to know about a guest lives here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rctl::ResourceLimits;

/// Number of serial ports a guest can expose (com1..com4)
pub const COM_PORTS: usize = 4;

/// Device value that asks for an nmdm pair named after the guest
pub const AUTO_COM_DEVICE: &str = "AUTO";

/// One serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComConfig {
    pub enabled: bool,
    /// Guest-facing nmdm device (ending in `A`), or `AUTO`
    pub device: String,
    /// Baud rate applied to the host-facing end
    pub speed: u32,
    /// Persist console output to `com<N>_out.log`
    pub log: bool,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: AUTO_COM_DEVICE.to_string(),
            speed: 115_200,
            log: false,
        }
    }
}

impl ComConfig {
    fn console() -> Self {
        Self {
            enabled: true,
            log: true,
            ..Self::default()
        }
    }
}

/// Hardware and runtime settings of a guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    pub description: String,
    pub cpu: u16,
    pub mem_mb: u32,

    // bhyve runtime flags
    pub acpi: bool,
    pub host_bridge: bool,
    pub utc_time: bool,
    pub halt_on_idle: bool,
    pub exit_on_pause: bool,
    pub wire_memory: bool,
    pub destroy_on_power_off: bool,
    pub ignore_unknown_msr: bool,

    // framebuffer
    pub screen: bool,
    pub screen_width: u32,
    pub screen_height: u32,
    pub vnc_wait: bool,
    pub tablet: bool,

    // sound
    pub sound: bool,
    pub sound_in: String,
    pub sound_out: String,

    // gdb stub
    pub debug: bool,
    pub debug_wait: bool,

    pub com: [ComConfig; COM_PORTS],
    pub extra_args: Vec<String>,

    pub autostart: bool,
    pub autostart_delay_secs: u64,
    /// Respawn bhyve after a guest-initiated reboot
    pub restart: bool,
    pub restart_delay_secs: u64,
    /// Upper bound for each termination phase
    pub max_wait_secs: u64,

    pub limits: ResourceLimits,
    /// Nice value applied to the hypervisor process; 0 leaves it alone
    pub priority: i32,

    /// Keep `BHYVE_UEFI_VARS.fd` across stops
    pub store_uefi_vars: bool,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            cpu: 1,
            mem_mb: 256,
            acpi: true,
            host_bridge: true,
            utc_time: true,
            halt_on_idle: true,
            exit_on_pause: true,
            wire_memory: false,
            destroy_on_power_off: true,
            ignore_unknown_msr: true,
            screen: true,
            screen_width: 1920,
            screen_height: 1080,
            vnc_wait: false,
            tablet: true,
            sound: false,
            sound_in: "/dev/dsp0".to_string(),
            sound_out: "/dev/dsp0".to_string(),
            debug: false,
            debug_wait: false,
            com: [
                ComConfig::console(),
                ComConfig::default(),
                ComConfig::default(),
                ComConfig::default(),
            ],
            extra_args: Vec::new(),
            autostart: false,
            autostart_delay_secs: 0,
            restart: true,
            restart_delay_secs: 1,
            max_wait_secs: 120,
            limits: ResourceLimits::default(),
            priority: 0,
            store_uefi_vars: true,
        }
    }
}

impl GuestConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn autostart_delay(&self) -> Duration {
        Duration::from_secs(self.autostart_delay_secs)
    }
}
