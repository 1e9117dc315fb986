use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::vm::config::VmConfig;
use crate::vm::session::SharedDirectory;
use crate::vm::storage::VmDirectory;

/// Runtime state as observed by the hypervisor, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Stopped,
    Running,
    Paused,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Stopped => write!(f, "stopped"),
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Paused => write!(f, "paused"),
        }
    }
}

/// Hardware model and machine identifier produced by a first-boot install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformIdentity {
    pub hardware_model: Vec<u8>,
    pub machine_identifier: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Expose a framebuffer the display adapter can relay.
    pub graphics: bool,
    /// Installer or live media attached as a removable drive.
    pub iso: Option<PathBuf>,
    pub shared_directories: Vec<SharedDirectory>,
}

/// Install progress in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Platform hypervisor primitives
///
/// Implementations key running instances by VM directory path and must be
/// safe to call concurrently for different VMs. The controller guarantees
/// calls for a single VM are serialized.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Returns the name of the hypervisor (e.g. "vfkit")
    fn name(&self) -> &str;

    /// Create an empty EFI variable store at `path`.
    async fn create_nvram(&self, path: &Path) -> Result<()>;

    /// Create platform auxiliary storage (macOS guests) at `path`.
    async fn create_auxiliary_storage(&self, path: &Path, identity: &PlatformIdentity) -> Result<()>;

    /// Run the first-boot OS installation from `source` into the VM's disk and
    /// auxiliary storage. Long running; honours `cancel`.
    async fn install(
        &self,
        dir: &VmDirectory,
        config: &VmConfig,
        source: &Path,
        progress: ProgressFn,
        cancel: &CancelToken,
    ) -> Result<PlatformIdentity>;

    async fn start(&self, dir: &VmDirectory, config: &VmConfig, options: &StartOptions) -> Result<()>;

    /// Request a graceful shutdown and wait for the guest to go away.
    /// The caller bounds the wait.
    async fn stop(&self, dir: &VmDirectory) -> Result<()>;

    async fn pause(&self, dir: &VmDirectory) -> Result<()>;

    async fn resume(&self, dir: &VmDirectory) -> Result<()>;

    async fn state(&self, dir: &VmDirectory) -> Result<RuntimeState>;

    /// Where the guest framebuffer is served, once running with graphics.
    async fn display_endpoint(&self, dir: &VmDirectory) -> Result<Option<SocketAddr>>;

    /// URL of the newest restore image the platform can install.
    async fn latest_restore_image_url(&self) -> Result<String>;
}
