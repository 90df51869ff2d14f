//! Per-process resource limits via FreeBSD rctl(8)
//!
//! # Why rctl?
//!
//! Without limits, one guest can saturate host CPU or disks and starve the
//! others. rctl attaches kernel-enforced rules to the bhyve process itself,
//! so the caps follow the guest no matter which wrapper launched it.
//!
//! # Example Usage
//!
//! ```ignore
//! use bhyvisor::rctl::{RctlManager, ResourceLimits};
//!
//! let rctl = RctlManager::new(runner, tools);
//! rctl.apply(bhyve_pid, &ResourceLimits { pcpu: 200, ..Default::default() });
//! rctl.clear(bhyve_pid);
//! ```

pub mod manager;

pub use manager::{RctlManager, ResourceLimits};
