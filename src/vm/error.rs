//! VM Error Types
//!
//! Every failure the storage layout, configuration store and lifecycle
//! controller can report. Callers match on variants; nothing here is retried.

use std::path::PathBuf;

use crate::registry::PullError;
use crate::vm::display::DisplayError;

/// Result type alias for VM operations
pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    // ---- directory / configuration ----
    /// A VM with this name already exists in the location
    #[error("VM '{0}' already exists")]
    AlreadyExists(String),

    /// No VM with this name exists in the location
    #[error("VM '{0}' not found")]
    NotFound(String),

    /// The VM directory is missing its config, disk or nvram
    #[error("VM '{0}' is not initialized (missing config, disk or nvram)")]
    NotInitialized(String),

    #[error("Invalid VM name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Configuration not found at {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Invalid configuration data at {}: {reason}", path.display())]
    InvalidConfigData { path: PathBuf, reason: String },

    #[error("Invalid configuration value: {0}")]
    InvalidConfigValue(String),

    #[error("Failed to create {}: {reason}", path.display())]
    FileCreationFailed { path: PathBuf, reason: String },

    /// A storage location name that is not configured
    #[error("Storage location '{0}' is not configured")]
    UnknownLocation(String),

    /// The location's root directory does not exist
    #[error("Storage location {} does not exist", .0.display())]
    LocationNotFound(PathBuf),

    #[error("Storage location {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("Storage location {} is not writable", .0.display())]
    NotWritable(PathBuf),

    // ---- state ----
    #[error("VM '{0}' is not running")]
    NotRunning(String),

    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),

    #[error("VM '{0}' is not paused")]
    NotPaused(String),

    /// The operation needs the VM stopped first
    #[error("VM '{name}' is {state}; stop it before running {operation}")]
    MustBeStopped {
        name: String,
        state: String,
        operation: &'static str,
    },

    /// First boot / OS installation never completed
    #[error("VM '{0}' has no completed installation; create it again from an image or installer")]
    InstallNotStarted(String),

    #[error("VM '{name}' did not stop within {timeout_secs}s")]
    StopTimeout { name: String, timeout_secs: u64 },

    /// Another vmkeeper process started this VM and owns its hypervisor
    #[error("VM '{0}' is running in another vmkeeper process; send the command to that process with --server")]
    RunningElsewhere(String),

    /// Another process holds the advisory lock for this VM
    #[error("VM '{0}' is locked by another operation")]
    Busy(String),

    // ---- resources ----
    #[error("Disk cannot shrink from {current} to {requested} bytes")]
    ResizeTooSmall { current: u64, requested: u64 },

    #[error(transparent)]
    Display(#[from] DisplayError),

    // ---- collaborators ----
    #[error(transparent)]
    Pull(#[from] PullError),

    #[error("Hypervisor {operation} failed: {message}")]
    Hypervisor {
        operation: &'static str,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VmError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VmError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn hypervisor(operation: &'static str, err: anyhow::Error) -> Self {
        VmError::Hypervisor {
            operation,
            message: format!("{:#}", err),
        }
    }

    /// True for "the thing you asked about does not exist" errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VmError::NotFound(_)
                | VmError::ConfigNotFound(_)
                | VmError::UnknownLocation(_)
                | VmError::LocationNotFound(_)
        )
    }

    /// True for errors caused by the VM being in the wrong lifecycle state.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            VmError::AlreadyExists(_)
                | VmError::NotRunning(_)
                | VmError::AlreadyRunning(_)
                | VmError::NotPaused(_)
                | VmError::MustBeStopped { .. }
                | VmError::InstallNotStarted(_)
                | VmError::Busy(_)
                | VmError::RunningElsewhere(_)
                | VmError::NotInitialized(_)
        )
    }
}
