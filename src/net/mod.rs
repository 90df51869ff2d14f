//! Host networking for guest NICs
//!
//! Each guest NIC is backed by a host tap/vmnet interface that is created
//! before launch, optionally added to a bridge, and destroyed on teardown.
//! Switch management itself lives elsewhere; this only adds and removes
//! members.

use std::collections::BTreeSet;
use std::sync::Arc;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::debug;

use crate::config::ToolPaths;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::inventory::NicInfo;

/// Lifecycle of the host side of a guest NIC
pub trait NetworkOps: Send + Sync {
    /// Create and bring up the backend device
    fn build(&self, device: &str, nic: &NicInfo) -> Result<()>;
    fn demolish(&self, device: &str, nic: &NicInfo) -> Result<()>;
    /// Add the device to the NIC's switch
    fn connect(&self, device: &str, nic: &NicInfo) -> Result<()>;
    fn disconnect(&self, device: &str, nic: &NicInfo) -> Result<()>;
}

/// Lists host interfaces that are administratively up
pub trait InterfaceProbe: Send + Sync {
    fn up_interfaces(&self) -> Result<Vec<String>>;
}

/// [`NetworkOps`] driven by ifconfig(8)
pub struct IfconfigNetwork {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl IfconfigNetwork {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    fn ifconfig(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let (program, args) = self.tools.privileged(&self.tools.ifconfig, args);
        debug!(program = %program.display(), args = ?args, "running ifconfig");
        let output = self.runner.run(&program, &args)?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("ifconfig {:?} failed: {}", args, output.stderr.trim()),
            )))
        }
    }
}

impl NetworkOps for IfconfigNetwork {
    fn build(&self, device: &str, _nic: &NicInfo) -> Result<()> {
        self.ifconfig(&[device, "create"])?;
        self.ifconfig(&[device, "up"])
    }

    fn demolish(&self, device: &str, _nic: &NicInfo) -> Result<()> {
        self.ifconfig(&[device, "destroy"])
    }

    fn connect(&self, device: &str, nic: &NicInfo) -> Result<()> {
        if nic.switch.is_empty() {
            return Ok(());
        }
        self.ifconfig(&[&nic.switch, "addm", device])
    }

    fn disconnect(&self, device: &str, nic: &NicInfo) -> Result<()> {
        if nic.switch.is_empty() {
            return Ok(());
        }
        self.ifconfig(&[&nic.switch, "deletem", device])
    }
}

/// [`InterfaceProbe`] over getifaddrs(3)
#[derive(Debug, Default, Clone, Copy)]
pub struct HostInterfaces;

impl InterfaceProbe for HostInterfaces {
    fn up_interfaces(&self) -> Result<Vec<String>> {
        let addrs = getifaddrs().map_err(std::io::Error::from)?;
        let names: BTreeSet<String> = addrs
            .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
            .map(|ifa| ifa.interface_name)
            .collect();
        Ok(names.into_iter().collect())
    }
}
