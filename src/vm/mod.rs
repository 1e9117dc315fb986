// Local VM Management Module
//
// Storage layout, configuration store, disk allocator and the lifecycle
// controller, plus the hypervisor and remote-display adapters it drives.
//
// Key invariants:
// - A VM directory is initialized iff config, disk and nvram exist
// - Disk size only grows
// - Mutating operations on one VM are serialized across processes

pub mod config;
pub mod controller;
pub mod disk;
pub mod display;
pub mod error;
pub mod hypervisor;
pub mod lock;
pub mod mock;
pub mod session;
pub mod storage;
pub mod vfkit;

#[cfg(test)]
mod proptests;

pub use config::{OsKind, Resolution, VmConfig, VmConfigUpdate};
pub use controller::{Controller, CreateOptions, RunOptions, VmDetails, VmSource};
pub use error::{VmError, VmResult};
pub use hypervisor::{Hypervisor, RuntimeState};
pub use storage::{StorageLayout, VmDirectory};
