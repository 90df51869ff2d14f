//! Serial console handling
//!
//! Guests talk to the host over nmdm(4) pairs. bhyve opens the `A` end;
//! the daemon reads the matching `B` end and tees it into a log file and,
//! optionally, one live subscriber.

pub mod logger;

use std::path::{Path, PathBuf};

pub use logger::{ConsoleLogger, SUBSCRIBER_CAPACITY};

use crate::error::{Error, Result};
use crate::vm::config::{GuestConfig, AUTO_COM_DEVICE, COM_PORTS};
use crate::vm::handle::ComState;

/// Guest-facing device name for an `AUTO` console
pub fn auto_device(name: &str, port: usize) -> String {
    format!("/dev/nmdm-{name}-com{port}-A")
}

/// Host-facing companion of a guest-facing nmdm device
pub fn host_side(device: &str) -> String {
    match device.strip_suffix('A') {
        Some(stem) => format!("{stem}B"),
        None => device.to_string(),
    }
}

/// `<state_dir>/<name>/com<port>_out.log`
pub fn log_path(state_dir: &Path, name: &str, port: usize) -> PathBuf {
    state_dir.join(name).join(format!("com{port}_out.log"))
}

/// Resolve the device of every enabled console.
///
/// Disabled consoles come back empty. Ports are numbered from 1.
pub fn resolve_com_devices(name: &str, config: &GuestConfig) -> Result<[ComState; COM_PORTS]> {
    let mut resolved: [ComState; COM_PORTS] = Default::default();
    for (index, com) in config.com.iter().enumerate() {
        if !com.enabled {
            continue;
        }
        let port = index + 1;
        let device = if com.device == AUTO_COM_DEVICE {
            auto_device(name, port)
        } else {
            com.device.trim().to_string()
        };

        if !Path::new(&device).is_absolute() {
            return Err(Error::InvalidComDevice {
                port,
                device,
                reason: "not an absolute device path".to_string(),
            });
        }
        if !device.ends_with('A') {
            return Err(Error::InvalidComDevice {
                port,
                device,
                reason: "guest side of an nmdm pair must end in 'A'".to_string(),
            });
        }

        resolved[index] = ComState {
            device,
            readable: false,
            logging: com.log,
        };
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_and_explicit_devices() {
        let mut config = GuestConfig::default();
        config.com[1].enabled = true;
        config.com[1].device = "/dev/nmdm7A".to_string();

        let com = resolve_com_devices("web", &config).unwrap();
        assert_eq!(com[0].device, "/dev/nmdm-web-com1-A");
        assert!(com[0].logging);
        assert_eq!(com[1].device, "/dev/nmdm7A");
        assert!(!com[1].logging);
        assert!(com[2].device.is_empty());
        assert!(com[3].device.is_empty());
    }

    #[test]
    fn test_rejects_host_side_device() {
        let mut config = GuestConfig::default();
        config.com[0].device = "/dev/nmdm0B".to_string();
        let err = resolve_com_devices("web", &config).unwrap_err();
        assert!(matches!(err, Error::InvalidComDevice { port: 1, .. }));

        config.com[0].device = "nmdmA".to_string();
        assert!(resolve_com_devices("web", &config).is_err());
    }

    #[test]
    fn test_host_side_swaps_trailing_letter() {
        assert_eq!(host_side("/dev/nmdm-web-com1-A"), "/dev/nmdm-web-com1-B");
        assert_eq!(host_side("/dev/ttyu0"), "/dev/ttyu0");
        assert_eq!(
            log_path(Path::new("/var/run/bhyvisor"), "web", 2),
            PathBuf::from("/var/run/bhyvisor/web/com2_out.log")
        );
    }
}
