//! bhyvisor - bhyve guest lifecycle supervisor
//!
//! This library drives bhyve guests through their lifecycle, multiplexes
//! their serial consoles, enforces per-guest resource limits and keeps disks
//! and NICs from being shared between guests.
//!
//! # Modules
//!
//! - `vm` - Guest registry, lifecycle state machine and process supervision
//! - `console` - Serial console logging and streaming
//! - `rctl` - Per-process resource limits via rctl(8)
//! - `net` - Host-side NIC devices and interface discovery
//! - `inventory` - Disk, ISO and NIC lookups
//! - `store` - Guest record persistence
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - Structured logging setup
//!
//! # Quick Start
//!
//! ```ignore
//! use bhyvisor::{GuestManager, ManagerParts};
//!
//! let manager = Arc::new(GuestManager::new(ManagerParts::host(&config, registry, inventory)));
//! let guest = manager.create_guest("web", GuestConfig::default())?;
//! manager.start(&guest.id()).await?;
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod metrics;
pub mod net;
pub mod rctl;
pub mod store;
pub mod telemetry;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use config::DaemonConfig;
pub use error::{EntityKind, Error, Result};
pub use rctl::ResourceLimits;
pub use vm::{Guest, GuestConfig, GuestManager, GuestRegistry, GuestStatus, ManagerParts};
