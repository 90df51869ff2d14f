//! Error types for the guest supervisor.

use std::fmt;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of entity an attachment or lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Guest,
    Disk,
    Iso,
    Nic,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Guest => "guest",
            EntityKind::Disk => "disk",
            EntityKind::Iso => "iso",
            EntityKind::Nic => "nic",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to callers of the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Reference validation
    // =========================================================================
    /// Referenced guest, disk, ISO or NIC does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Reference is not a well-formed id.
    #[error("invalid {kind} reference: '{id}'")]
    InvalidReference { kind: EntityKind, id: String },

    /// Same id listed twice in one request.
    #[error("{kind} {id} listed more than once")]
    DuplicateReference { kind: EntityKind, id: String },

    /// Disk or NIC already belongs to another guest.
    #[error("{kind} {id} is already attached to guest '{guest}'")]
    AlreadyAttached {
        kind: EntityKind,
        id: String,
        guest: String,
    },

    // =========================================================================
    // Lifecycle preconditions
    // =========================================================================
    /// Operation requires the guest to be stopped.
    #[error("guest '{0}' is not stopped")]
    NotStopped(String),

    /// Operation requires the guest to be running.
    #[error("guest '{0}' is not running")]
    NotRunning(String),

    /// Serial console device is malformed or unusable.
    #[error("invalid com{port} device '{device}': {reason}")]
    InvalidComDevice {
        port: usize,
        device: String,
        reason: String,
    },

    /// Guest name collides with an existing guest.
    #[error("guest name '{0}' is already in use")]
    AlreadyExists(String),

    /// Guest name is not usable in paths and device names.
    #[error("invalid guest name '{0}'")]
    InvalidName(String),

    /// Every port in the configured range is reserved.
    #[error("no free {0} port available")]
    PortsExhausted(&'static str),

    /// Attached devices need more PCI slots than bhyve has.
    #[error("guest needs {needed} PCI slots, only {limit} are available")]
    TooManyDevices { needed: usize, limit: usize },

    // =========================================================================
    // Infrastructure
    // =========================================================================
    /// Record store failure.
    #[error("persistence failure: {0}")]
    InternalPersistence(String),

    /// Daemon configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn guest_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: EntityKind::Guest,
            id: id.to_string(),
        }
    }

    pub(crate) fn persistence(err: impl fmt::Display) -> Self {
        Error::InternalPersistence(err.to_string())
    }
}
