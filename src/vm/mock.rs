// Recording hypervisor fake
//
// Keeps runtime state in memory, records every call and can be told to fail
// or stall specific operations. Used by unit and integration tests and by
// `serve --mock` for exercising front ends without a hypervisor.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::vm::config::VmConfig;
use crate::vm::hypervisor::{Hypervisor, PlatformIdentity, ProgressFn, RuntimeState, StartOptions};
use crate::vm::storage::VmDirectory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    CreateNvram(PathBuf),
    CreateAuxiliaryStorage(PathBuf),
    Install(String),
    Start(String),
    Stop(String),
    Pause(String),
    Resume(String),
}

impl HypervisorCall {
    pub fn operation(&self) -> &'static str {
        match self {
            HypervisorCall::CreateNvram(_) => "create_nvram",
            HypervisorCall::CreateAuxiliaryStorage(_) => "create_auxiliary_storage",
            HypervisorCall::Install(_) => "install",
            HypervisorCall::Start(_) => "start",
            HypervisorCall::Stop(_) => "stop",
            HypervisorCall::Pause(_) => "pause",
            HypervisorCall::Resume(_) => "resume",
        }
    }
}

pub struct MockHypervisor {
    states: Mutex<HashMap<PathBuf, RuntimeState>>,
    calls: Mutex<Vec<HypervisorCall>>,
    failing: Mutex<HashSet<&'static str>>,
    stop_delay: Mutex<Option<Duration>>,
    display_endpoint: Option<SocketAddr>,
    identity: PlatformIdentity,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            stop_delay: Mutex::new(None),
            display_endpoint: Some(SocketAddr::from(([127, 0, 0, 1], 5900))),
            identity: PlatformIdentity {
                hardware_model: b"mock-hardware-model".to_vec(),
                machine_identifier: b"mock-machine-identifier".to_vec(),
            },
        }
    }

    /// A fake whose guests expose no framebuffer endpoint.
    pub fn headless() -> Self {
        Self {
            display_endpoint: None,
            ..Self::new()
        }
    }

    /// Make `operation` (e.g. "start") fail until cleared.
    pub fn fail_on(&self, operation: &'static str) {
        lock(&self.failing).insert(operation);
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Delay every `stop` by `delay` before the guest reports stopped.
    pub fn set_stop_delay(&self, delay: Option<Duration>) {
        *lock(&self.stop_delay) = delay;
    }

    /// Force the observed state, e.g. to simulate a guest that shut itself down.
    pub fn set_state(&self, dir: &VmDirectory, state: RuntimeState) {
        lock(&self.states).insert(dir.path().to_path_buf(), state);
    }

    pub fn calls(&self) -> Vec<HypervisorCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    fn record(&self, call: HypervisorCall) -> Result<()> {
        let operation = call.operation();
        lock(&self.calls).push(call);
        if lock(&self.failing).contains(operation) {
            bail!("injected {} failure", operation);
        }
        Ok(())
    }

    fn current(&self, dir: &VmDirectory) -> RuntimeState {
        lock(&self.states)
            .get(dir.path())
            .copied()
            .unwrap_or(RuntimeState::Stopped)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_nvram(&self, path: &Path) -> Result<()> {
        self.record(HypervisorCall::CreateNvram(path.to_path_buf()))?;
        tokio::fs::write(path, b"").await?;
        Ok(())
    }

    async fn create_auxiliary_storage(&self, path: &Path, identity: &PlatformIdentity) -> Result<()> {
        self.record(HypervisorCall::CreateAuxiliaryStorage(path.to_path_buf()))?;
        tokio::fs::write(path, &identity.hardware_model).await?;
        Ok(())
    }

    async fn install(
        &self,
        dir: &VmDirectory,
        _config: &VmConfig,
        _source: &Path,
        progress: ProgressFn,
        cancel: &CancelToken,
    ) -> Result<PlatformIdentity> {
        self.record(HypervisorCall::Install(dir.name().to_string()))?;
        for step in 0..=4 {
            if cancel.is_cancelled() {
                bail!("install cancelled");
            }
            progress(step as f64 / 4.0);
            tokio::task::yield_now().await;
        }
        self.create_auxiliary_storage(&dir.nvram_path(), &self.identity)
            .await?;
        Ok(self.identity.clone())
    }

    async fn start(&self, dir: &VmDirectory, _config: &VmConfig, _options: &StartOptions) -> Result<()> {
        self.record(HypervisorCall::Start(dir.name().to_string()))?;
        if self.current(dir) != RuntimeState::Stopped {
            bail!("{} is already running", dir.name());
        }
        self.set_state(dir, RuntimeState::Running);
        Ok(())
    }

    async fn stop(&self, dir: &VmDirectory) -> Result<()> {
        self.record(HypervisorCall::Stop(dir.name().to_string()))?;
        if self.current(dir) == RuntimeState::Stopped {
            return Err(anyhow!("{} is not running", dir.name()));
        }
        let delay = *lock(&self.stop_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.set_state(dir, RuntimeState::Stopped);
        Ok(())
    }

    async fn pause(&self, dir: &VmDirectory) -> Result<()> {
        self.record(HypervisorCall::Pause(dir.name().to_string()))?;
        if self.current(dir) != RuntimeState::Running {
            bail!("{} is not running", dir.name());
        }
        self.set_state(dir, RuntimeState::Paused);
        Ok(())
    }

    async fn resume(&self, dir: &VmDirectory) -> Result<()> {
        self.record(HypervisorCall::Resume(dir.name().to_string()))?;
        if self.current(dir) != RuntimeState::Paused {
            bail!("{} is not paused", dir.name());
        }
        self.set_state(dir, RuntimeState::Running);
        Ok(())
    }

    async fn state(&self, dir: &VmDirectory) -> Result<RuntimeState> {
        Ok(self.current(dir))
    }

    async fn display_endpoint(&self, dir: &VmDirectory) -> Result<Option<SocketAddr>> {
        if self.current(dir) == RuntimeState::Stopped {
            return Ok(None);
        }
        Ok(self.display_endpoint)
    }

    async fn latest_restore_image_url(&self) -> Result<String> {
        Ok("https://example.invalid/restore/latest.ipsw".to_string())
    }
}
