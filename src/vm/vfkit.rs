//! Hypervisor adapter driving `vfkit` (macOS Virtualization.framework wrapper).
//!
//! ```text
//! VfkitHypervisor::start
//!     └─► tokio::process::Command  →  vfkit child process
//!                                       └─► REST API on localhost:<port>
//! stop / pause / resume / state  ──►  PUT|GET /vm/state
//! ```
//!
//! vfkit boots EFI guests. It cannot run a macOS first-boot install, and it
//! shows graphics in a local window rather than over the network, so
//! `display_endpoint` is always `None`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::units::MB;
use crate::vm::config::{OsKind, VmConfig};
use crate::vm::hypervisor::{Hypervisor, PlatformIdentity, ProgressFn, RuntimeState, StartOptions};
use crate::vm::storage::VmDirectory;

const RESTORE_IMAGE_CATALOG: &str =
    "https://mesu.apple.com/assets/macos/com_apple_macOSIPSW/com_apple_macOSIPSW.xml";
const API_READY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Instance {
    child: Mutex<Child>,
    rest_port: u16,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

pub struct VfkitHypervisor {
    binary: Option<PathBuf>,
    client: reqwest::Client,
    instances: Mutex<HashMap<PathBuf, Arc<Instance>>>,
}

impl Default for VfkitHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl VfkitHypervisor {
    pub fn new() -> Self {
        Self {
            binary: None,
            client: reqwest::Client::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Use an explicit vfkit binary instead of searching PATH.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary: Some(binary),
            ..Self::new()
        }
    }

    fn binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => find_vfkit(),
        }
    }

    async fn instance(&self, dir: &VmDirectory) -> Option<Arc<Instance>> {
        self.instances.lock().await.get(dir.path()).cloned()
    }

    async fn put_state(&self, instance: &Instance, state: &str) -> Result<()> {
        let url = format!("http://localhost:{}/vm/state", instance.rest_port);
        let response = self
            .client
            .put(&url)
            .json(&serde_json::json!({ "state": state }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .with_context(|| format!("PUT {}", url))?;
        if !response.status().is_success() {
            bail!("PUT {} returned {}", url, response.status());
        }
        Ok(())
    }

    async fn get_state(&self, rest_port: u16) -> Result<RuntimeState> {
        let url = format!("http://localhost:{}/vm/state", rest_port);
        let body: StateResponse = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()?
            .json()
            .await
            .context("Malformed vfkit state response")?;
        Ok(parse_state(&body.state))
    }

    async fn wait_for_api(&self, instance: &Instance) -> Result<()> {
        let deadline = tokio::time::Instant::now() + API_READY_TIMEOUT;
        loop {
            if let Some(status) = instance.child.lock().await.try_wait()? {
                bail!("vfkit exited during startup with {}", status);
            }
            if self.get_state(instance.rest_port).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "vfkit REST API on port {} not ready after {:?}",
                    instance.rest_port,
                    API_READY_TIMEOUT
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Hypervisor for VfkitHypervisor {
    fn name(&self) -> &str {
        "vfkit"
    }

    async fn create_nvram(&self, path: &Path) -> Result<()> {
        // vfkit initialises an empty variable store on first boot.
        tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(())
    }

    async fn create_auxiliary_storage(&self, _path: &Path, _identity: &PlatformIdentity) -> Result<()> {
        bail!("vfkit cannot create macOS auxiliary storage")
    }

    async fn install(
        &self,
        _dir: &VmDirectory,
        _config: &VmConfig,
        source: &Path,
        _progress: ProgressFn,
        _cancel: &CancelToken,
    ) -> Result<PlatformIdentity> {
        bail!(
            "vfkit cannot install macOS from {}; create the VM from a pulled image instead",
            source.display()
        )
    }

    async fn start(&self, dir: &VmDirectory, config: &VmConfig, options: &StartOptions) -> Result<()> {
        if config.os == OsKind::MacOs {
            bail!("vfkit cannot boot macOS guests");
        }
        if let Some(instance) = self.instance(dir).await {
            if instance.child.lock().await.try_wait()?.is_none() {
                bail!("a vfkit process is already running for {}", dir.path().display());
            }
        }

        let binary = self.binary()?;
        let rest_port = free_port()?;
        let mut cmd = build_command(&binary, dir, config, options, rest_port).await?;
        debug!(vm = %dir.name(), command = ?cmd, "Spawning vfkit");

        // the VM never outlives the process that started it
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn vfkit process")?;
        info!(vm = %dir.name(), pid = ?child.id(), rest_port, "vfkit started");

        let instance = Arc::new(Instance {
            child: Mutex::new(child),
            rest_port,
        });
        if let Err(e) = self.wait_for_api(&instance).await {
            let _ = instance.child.lock().await.kill().await;
            return Err(e);
        }

        self.instances
            .lock()
            .await
            .insert(dir.path().to_path_buf(), instance);
        Ok(())
    }

    async fn stop(&self, dir: &VmDirectory) -> Result<()> {
        let instance = self
            .instance(dir)
            .await
            .ok_or_else(|| anyhow!("no vfkit process for {}", dir.path().display()))?;

        if let Err(e) = self.put_state(&instance, "Stop").await {
            warn!(vm = %dir.name(), error = %e, "Graceful stop request failed");
            return Err(e);
        }

        // The caller bounds this wait; the process is never killed here.
        loop {
            if let Some(status) = instance.child.lock().await.try_wait()? {
                info!(vm = %dir.name(), exit_status = ?status, "vfkit exited");
                self.instances.lock().await.remove(dir.path());
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn pause(&self, dir: &VmDirectory) -> Result<()> {
        let instance = self
            .instance(dir)
            .await
            .ok_or_else(|| anyhow!("no vfkit process for {}", dir.path().display()))?;
        self.put_state(&instance, "Pause").await
    }

    async fn resume(&self, dir: &VmDirectory) -> Result<()> {
        let instance = self
            .instance(dir)
            .await
            .ok_or_else(|| anyhow!("no vfkit process for {}", dir.path().display()))?;
        self.put_state(&instance, "Resume").await
    }

    async fn state(&self, dir: &VmDirectory) -> Result<RuntimeState> {
        let Some(instance) = self.instance(dir).await else {
            return Ok(RuntimeState::Stopped);
        };
        if instance.child.lock().await.try_wait()?.is_some() {
            self.instances.lock().await.remove(dir.path());
            return Ok(RuntimeState::Stopped);
        }
        match self.get_state(instance.rest_port).await {
            Ok(state) => Ok(state),
            Err(e) => {
                // Process alive but API unresponsive: treat as running.
                debug!(vm = %dir.name(), error = %e, "vfkit state query failed");
                Ok(RuntimeState::Running)
            }
        }
    }

    async fn display_endpoint(&self, _dir: &VmDirectory) -> Result<Option<SocketAddr>> {
        Ok(None)
    }

    async fn latest_restore_image_url(&self) -> Result<String> {
        let catalog = self
            .client
            .get(RESTORE_IMAGE_CATALOG)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Failed to fetch restore image catalog")?
            .error_for_status()?
            .text()
            .await?;
        latest_ipsw_url(&catalog).ok_or_else(|| anyhow!("No restore image found in catalog"))
    }
}

fn parse_state(raw: &str) -> RuntimeState {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("paus") {
        RuntimeState::Paused
    } else if lower.contains("running") || lower.contains("resuming") || lower.contains("starting") {
        RuntimeState::Running
    } else {
        RuntimeState::Stopped
    }
}

/// The catalog lists restore images oldest first; take the last `.ipsw` URL.
fn latest_ipsw_url(catalog: &str) -> Option<String> {
    catalog
        .split("<string>")
        .skip(1)
        .filter_map(|chunk| chunk.split("</string>").next())
        .map(str::trim)
        .filter(|s| s.starts_with("https://") && s.ends_with(".ipsw"))
        .last()
        .map(str::to_string)
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").context("No free port for vfkit API")?;
    Ok(listener.local_addr()?.port())
}

/// Resolve the `vfkit` binary from PATH or the Homebrew prefixes.
fn find_vfkit() -> Result<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("vfkit");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
        let candidate = PathBuf::from(path);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    bail!("vfkit binary not found. Install it with: brew install vfkit")
}

async fn build_command(
    vfkit: &Path,
    dir: &VmDirectory,
    config: &VmConfig,
    options: &StartOptions,
    rest_port: u16,
) -> Result<Command> {
    let mut cmd = Command::new(vfkit);

    let nvram = dir.nvram_path();
    let nvram_empty = tokio::fs::metadata(&nvram)
        .await
        .map(|m| m.len() == 0)
        .unwrap_or(true);
    let mut bootloader = format!("efi,variable-store={}", nvram.display());
    if nvram_empty {
        bootloader.push_str(",create");
    }
    cmd.arg("--bootloader").arg(bootloader);

    cmd.arg("--cpus").arg(config.cpu_count.to_string());
    cmd.arg("--memory").arg((config.memory_size / MB).to_string());

    cmd.arg("--device")
        .arg(format!("virtio-blk,path={}", dir.disk_path().display()));
    cmd.arg("--device")
        .arg(format!("virtio-net,nat,mac={}", config.mac_address));
    cmd.arg("--device").arg("virtio-rng");

    if let Some(iso) = &options.iso {
        cmd.arg("--device")
            .arg(format!("usb-mass-storage,path={},readonly", iso.display()));
    }

    for shared in &options.shared_directories {
        if shared.read_only {
            warn!(tag = %shared.tag, "vfkit shares are always writable; ignoring read-only flag");
        }
        cmd.arg("--device").arg(format!(
            "virtio-fs,sharedDir={},mountTag={}",
            shared.host_path.display(),
            shared.tag
        ));
    }

    if options.graphics {
        cmd.arg("--device").arg(format!(
            "virtio-gpu,width={},height={}",
            config.display.width, config.display.height
        ));
        cmd.arg("--device").arg("virtio-input,keyboard");
        cmd.arg("--device").arg("virtio-input,pointing");
        cmd.arg("--gui");
    }

    cmd.arg("--restful-uri")
        .arg(format!("tcp://localhost:{}", rest_port));

    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::GB;
    use crate::vm::config::Resolution;
    use crate::vm::session::SharedDirectory;
    use crate::vm::storage::StorageLayout;
    use tempfile::TempDir;

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("VirtualMachineStateRunning"), RuntimeState::Running);
        assert_eq!(parse_state("VirtualMachineStatePaused"), RuntimeState::Paused);
        assert_eq!(parse_state("VirtualMachineStatePausing"), RuntimeState::Paused);
        assert_eq!(parse_state("VirtualMachineStateStopped"), RuntimeState::Stopped);
        assert_eq!(parse_state("VirtualMachineStateError"), RuntimeState::Stopped);
    }

    #[test]
    fn test_latest_ipsw_url() {
        let catalog = r#"<plist><dict>
            <key>FirmwareURL</key><string>https://updates.cdn-apple.com/a/UniversalMac_14.0_Restore.ipsw</string>
            <key>Other</key><string>not a url</string>
            <key>FirmwareURL</key><string>https://updates.cdn-apple.com/b/UniversalMac_15.1_Restore.ipsw</string>
        </dict></plist>"#;
        assert_eq!(
            latest_ipsw_url(catalog).unwrap(),
            "https://updates.cdn-apple.com/b/UniversalMac_15.1_Restore.ipsw"
        );
        assert_eq!(latest_ipsw_url("<plist/>"), None);
    }

    #[tokio::test]
    async fn test_build_command_arguments() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageLayout::single(tmp.path()).resolve("vm1", None).unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.nvram_path(), b"").unwrap();
        let config = VmConfig::new(OsKind::Linux, 2, 4 * GB, 20 * GB, Resolution::default());
        let options = StartOptions {
            graphics: true,
            iso: Some(PathBuf::from("/tmp/install.iso")),
            shared_directories: vec![SharedDirectory {
                host_path: PathBuf::from("/srv"),
                tag: "srv".to_string(),
                read_only: false,
            }],
        };

        let cmd = build_command(Path::new("/usr/bin/vfkit"), &dir, &config, &options, 4242)
            .await
            .unwrap();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.iter().any(|a| a.starts_with("efi,variable-store=") && a.ends_with(",create")));
        assert!(args.contains(&"4096".to_string()));
        assert!(args.contains(&format!("virtio-net,nat,mac={}", config.mac_address)));
        assert!(args.contains(&"usb-mass-storage,path=/tmp/install.iso,readonly".to_string()));
        assert!(args.contains(&"virtio-fs,sharedDir=/srv,mountTag=srv".to_string()));
        assert!(args.contains(&"virtio-gpu,width=1024,height=768".to_string()));
        assert!(args.contains(&"tcp://localhost:4242".to_string()));
    }

    #[tokio::test]
    async fn test_state_without_process_is_stopped() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageLayout::single(tmp.path()).resolve("vm1", None).unwrap();
        let hv = VfkitHypervisor::new();
        assert_eq!(hv.state(&dir).await.unwrap(), RuntimeState::Stopped);
        assert!(hv.stop(&dir).await.is_err());
        assert!(hv.display_endpoint(&dir).await.unwrap().is_none());
    }
}
