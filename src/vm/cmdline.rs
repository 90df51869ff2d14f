//! bhyve command-line assembly
//!
//! Turns a snapshot of a guest into the argument vector that launches it.
//! Pure: no lookups, no I/O. Everything host-dependent (resolved disks,
//! interfaces already up, allocated ports) arrives in [`InvocationInput`].
//!
//! ```text
//! sudo protect -i bhyve -A -H -P -D -w -u
//!      -l bootrom,<rom>,<vars> -c 2 -m 1024m
//!      -s 0,hostbridge
//!      -s 1,fbuf,tcp=0.0.0.0:6900,w=1920,h=1080
//!      -s 2,xhci,tablet
//!      -s 3,virtio-net,tap0                 ← one per NIC
//!      -s 4,nvme,/bhyve/disks/root.img      ← one per disk, then ISOs
//!      -s 5,lpc
//!      -l com1,/dev/nmdm-web-com1-A
//!      web
//! ```
//!
//! PCI slots come from a single counter so no two devices ever collide.
//! bhyve only has [`MAX_PCI_SLOTS`] slots on bus 0; an invocation that
//! needs more is rejected before anything is spawned.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::config::{GuestConfig, COM_PORTS};
use crate::error::{Error, Result};
use crate::config::ToolPaths;
use crate::inventory::{DiskInfo, IsoInfo, NicInfo};

/// Program and arguments to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Backend device picked for one NIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicDevice {
    pub nic_id: Uuid,
    pub device: String,
    pub nic: NicInfo,
}

/// Everything the builder reads
#[derive(Debug, Clone)]
pub struct InvocationInput<'a> {
    pub name: &'a str,
    pub config: &'a GuestConfig,
    pub disks: &'a [DiskInfo],
    pub isos: &'a [IsoInfo],
    pub nics: &'a [(Uuid, NicInfo)],
    pub vnc_port: u16,
    pub debug_port: u16,
    /// Guest-facing console devices; empty for disabled ports
    pub com_devices: &'a [String; COM_PORTS],
    pub uefi_vars: &'a Path,
    pub firmware: &'a Path,
    /// Interfaces currently up on the host
    pub host_interfaces: &'a [String],
}

/// Result of [`build_invocation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltInvocation {
    pub invocation: Invocation,
    pub nic_devices: Vec<NicDevice>,
}

/// Slots 0..=31 on PCI bus 0
pub const MAX_PCI_SLOTS: usize = 32;

/// Monotonic PCI slot counter shared by every device class
#[derive(Debug, Default)]
struct SlotCounter(usize);

impl SlotCounter {
    fn next(&mut self) -> usize {
        let slot = self.0;
        self.0 += 1;
        slot
    }
}

/// Lowest `<prefix><n>` that is neither up on the host nor already taken
fn free_device(prefix: &str, host: &HashSet<&str>, taken: &HashSet<String>) -> String {
    (0u32..)
        .map(|n| format!("{}{}", prefix, n))
        .find(|name| !host.contains(name.as_str()) && !taken.contains(name))
        .unwrap_or_else(|| format!("{}0", prefix))
}

/// PCI slots the guest will occupy
pub fn slots_needed(input: &InvocationInput<'_>) -> usize {
    let config = input.config;
    [
        config.host_bridge,
        config.screen,
        config.screen && config.tablet,
        config.sound,
        true, // lpc
    ]
    .iter()
    .filter(|on| **on)
    .count()
        + input.nics.len()
        + input.disks.len()
        + input.isos.len()
}

/// Assemble the full invocation for one guest start.
///
/// Fails with [`Error::TooManyDevices`] when the devices do not fit in
/// [`MAX_PCI_SLOTS`].
pub fn build_invocation(input: &InvocationInput<'_>, tools: &ToolPaths) -> Result<BuiltInvocation> {
    let needed = slots_needed(input);
    if needed > MAX_PCI_SLOTS {
        return Err(Error::TooManyDevices {
            needed,
            limit: MAX_PCI_SLOTS,
        });
    }

    let config = input.config;
    let mut args: Vec<String> = Vec::new();

    // wrappers: sudo -> protect -i -> bhyve
    let mut chain: Vec<String> = Vec::new();
    if let Some(sudo) = tools.sudo() {
        chain.push(sudo.display().to_string());
    }
    if let Some(protect) = tools.protect() {
        chain.push(protect.display().to_string());
        chain.push("-i".to_string());
    }
    chain.push(tools.bhyve.display().to_string());
    let program = PathBuf::from(chain.remove(0));
    args.extend(chain);

    let flags = [
        (config.acpi, "-A"),
        (config.halt_on_idle, "-H"),
        (config.exit_on_pause, "-P"),
        (config.wire_memory, "-S"),
        (config.destroy_on_power_off, "-D"),
        (config.ignore_unknown_msr, "-w"),
        (config.utc_time, "-u"),
    ];
    args.extend(flags.iter().filter(|(on, _)| *on).map(|(_, f)| f.to_string()));

    args.push("-l".to_string());
    args.push(format!(
        "bootrom,{},{}",
        input.firmware.display(),
        input.uefi_vars.display()
    ));
    args.push("-c".to_string());
    args.push(config.cpu.to_string());
    args.push("-m".to_string());
    args.push(format!("{}m", config.mem_mb));

    if config.debug && input.debug_port != 0 {
        args.push("-G".to_string());
        let wait = if config.debug_wait { "w" } else { "" };
        args.push(format!("{}{}", wait, input.debug_port));
    }

    let mut slots = SlotCounter::default();
    let mut slot_arg = |args: &mut Vec<String>, device: String| {
        args.push("-s".to_string());
        args.push(format!("{},{}", slots.next(), device));
    };

    if config.host_bridge {
        slot_arg(&mut args, "hostbridge".to_string());
    }

    if config.screen {
        let mut fbuf = format!(
            "fbuf,tcp=0.0.0.0:{},w={},h={}",
            input.vnc_port, config.screen_width, config.screen_height
        );
        if config.vnc_wait {
            fbuf.push_str(",wait");
        }
        slot_arg(&mut args, fbuf);

        if config.tablet {
            slot_arg(&mut args, "xhci,tablet".to_string());
        }
    }

    let host: HashSet<&str> = input.host_interfaces.iter().map(String::as_str).collect();
    let mut taken: HashSet<String> = HashSet::new();
    let mut nic_devices = Vec::with_capacity(input.nics.len());
    for (nic_id, nic) in input.nics {
        let device = free_device(nic.net_type.device_prefix(), &host, &taken);
        taken.insert(device.clone());

        let mut spec = format!("{},{}", nic.dev_type.as_str(), device);
        if !nic.mac.is_empty() && !nic.mac.eq_ignore_ascii_case("AUTO") {
            spec.push_str(&format!(",mac={}", nic.mac));
        }
        slot_arg(&mut args, spec);

        nic_devices.push(NicDevice {
            nic_id: *nic_id,
            device,
            nic: nic.clone(),
        });
    }

    for disk in input.disks {
        let mut spec = format!("{},{}", disk.dev_type.as_str(), disk.path.display());
        if !disk.cache {
            spec.push_str(",nocache");
        }
        if disk.direct {
            spec.push_str(",direct");
        }
        slot_arg(&mut args, spec);
    }

    for iso in input.isos {
        slot_arg(&mut args, format!("ahci-cd,{}", iso.path.display()));
    }

    if config.sound {
        slot_arg(
            &mut args,
            format!("hda,play={},rec={}", config.sound_out, config.sound_in),
        );
    }

    slot_arg(&mut args, "lpc".to_string());

    for (index, device) in input.com_devices.iter().enumerate() {
        if !device.is_empty() {
            args.push("-l".to_string());
            args.push(format!("com{},{}", index + 1, device));
        }
    }

    args.extend(config.extra_args.iter().cloned());
    args.push(input.name.to_string());

    Ok(BuiltInvocation {
        invocation: Invocation { program, args },
        nic_devices,
    })
}
