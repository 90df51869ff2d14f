//! Guest lifecycle management
//!
//! This module provides abstractions for managing bhyve guests including:
//! - Guest configuration and per-guest state
//! - The guest registry and attachment validation
//! - Command-line assembly, process supervision and termination
//! - The manager that ties a guest's lifecycle together

pub mod attach;
pub mod cmdline;
pub mod config;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod ports;
pub mod proctree;
pub mod registry;
pub mod terminate;

pub use attach::{validate_attachment, AttachKind};
pub use cmdline::{build_invocation, BuiltInvocation, Invocation, InvocationInput, NicDevice};
pub use config::{ComConfig, GuestConfig, AUTO_COM_DEVICE, COM_PORTS};
pub use handle::{ComState, Guest, GuestState, GuestStatus};
pub use lifecycle::{
    CommandSupervisor, ProcessEvent, ProcessSupervisor, RestartPolicy, Supervision, UEFI_VARS_FILE,
};
pub use manager::{GuestManager, ManagerParts};
pub use ports::PortAllocator;
pub use proctree::{find_hypervisor_pid, HostProcessTree, ProcessTree, MAX_SEARCH_DEPTH};
pub use registry::GuestRegistry;
pub use terminate::{terminate, HostSignaller, Signaller, Termination};
