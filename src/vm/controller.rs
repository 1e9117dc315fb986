// VM Lifecycle Controller
//
// Per-VM state machine:
//
//   Absent -> Initializing -> Stopped <-> Running <-> Paused
//                                 \-> Deleted
//
// Initializing is the `.staging-<uuid>` directory a create or clone fills
// before it is renamed into place. Stopped/Running/Paused are observed from
// the hypervisor, never persisted.
//
// Every mutating operation holds the VM's lock (in-process mutex plus an
// advisory lock file) for its whole duration. `get` and `list` take no lock;
// they read files that are only ever replaced by rename.
//
// A running VM belongs to the process whose hypervisor started it. That
// process holds the VM's run lease until the VM stops; any other process
// sees the lease and treats the VM as running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{Settings, VmDefaults};
use crate::metrics;
use crate::registry::{ImageRecord, Puller};
use crate::vm::config::{OsKind, Resolution, VmConfig, VmConfigTemplate, VmConfigUpdate, random_mac_address};
use crate::vm::disk;
use crate::vm::display::{DisplayError, RemoteDisplay};
use crate::vm::error::{VmError, VmResult};
use crate::vm::hypervisor::{Hypervisor, ProgressFn, RuntimeState, StartOptions};
use crate::vm::lock::{self, RunLease, VmGuard, VmLocks};
use crate::vm::session::{DisplaySession, SharedDirectory};
use crate::vm::storage::{DiskUsage, StorageLayout, VmDirectory};

/// Where a new VM's disk comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VmSource {
    /// Empty sparse disk and a fresh variable store.
    #[default]
    Blank,
    /// A pulled image, pulled first if it is not stored locally.
    Image(String),
    /// A restore image / installer run through the hypervisor's first-boot install.
    Installer(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub os: Option<OsKind>,
    pub cpu_count: Option<u32>,
    pub memory_size: Option<u64>,
    pub disk_size: Option<u64>,
    pub display: Option<Resolution>,
    pub location: Option<String>,
    pub source: VmSource,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Start a remote display session.
    pub display: bool,
    /// Requested display port; automatic when `None` or 0.
    pub display_port: Option<u16>,
    /// Open the local viewer once the display is up.
    pub open_client: bool,
    pub iso: Option<PathBuf>,
    pub shared_directories: Vec<SharedDirectory>,
    pub location: Option<String>,
    /// Materialize the VM from this image first when it does not exist.
    pub image: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            display: true,
            display_port: None,
            open_client: false,
            iso: None,
            shared_directories: Vec::new(),
            location: None,
            image: None,
        }
    }
}

/// Read-only projection of one VM.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDetails {
    pub name: String,
    pub location: String,
    pub path: PathBuf,
    pub config: VmConfig,
    pub state: RuntimeState,
    pub display_url: Option<String>,
    pub disk_usage: Option<DiskUsage>,
}

/// Who runs a VM, as seen from this process.
enum Owner {
    Here(RuntimeState),
    Elsewhere,
    Nobody,
}

struct LocalRun {
    dir: VmDirectory,
    _lease: RunLease,
}

pub struct Controller {
    storage: StorageLayout,
    hypervisor: Arc<dyn Hypervisor>,
    display: Arc<dyn RemoteDisplay>,
    puller: Option<Arc<Puller>>,
    locks: VmLocks,
    running: Mutex<HashMap<PathBuf, LocalRun>>,
    defaults: VmDefaults,
}

impl Controller {
    pub fn new(
        storage: StorageLayout,
        hypervisor: Arc<dyn Hypervisor>,
        display: Arc<dyn RemoteDisplay>,
        defaults: VmDefaults,
    ) -> Self {
        let lock_timeout = Duration::from_secs(defaults.lock_timeout_secs);
        Self {
            storage,
            hypervisor,
            display,
            puller: None,
            locks: VmLocks::new(lock_timeout),
            running: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    /// Controller over the configured storage locations and registry.
    pub fn from_settings(
        settings: &Settings,
        hypervisor: Arc<dyn Hypervisor>,
        display: Arc<dyn RemoteDisplay>,
    ) -> VmResult<Self> {
        let puller = Puller::from_settings(settings)?;
        Ok(Self::new(
            StorageLayout::from_settings(settings),
            hypervisor,
            display,
            settings.vm.clone(),
        )
        .with_puller(Arc::new(puller)))
    }

    pub fn with_puller(mut self, puller: Arc<Puller>) -> Self {
        self.puller = Some(puller);
        self
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    pub fn puller(&self) -> VmResult<&Arc<Puller>> {
        self.puller
            .as_ref()
            .ok_or_else(|| VmError::InvalidConfigValue("no image registry configured".to_string()))
    }

    pub fn hypervisor_name(&self) -> &str {
        self.hypervisor.name()
    }

    // ---- create -----------------------------------------------------------

    pub async fn create(&self, name: &str, options: CreateOptions, cancel: &CancelToken) -> VmResult<VmDetails> {
        let started = Instant::now();
        let result = self.create_inner(name, options, cancel).await;
        finish("create", name, started, &result);
        result
    }

    async fn create_inner(&self, name: &str, options: CreateOptions, cancel: &CancelToken) -> VmResult<VmDetails> {
        let dir = self.resolve_new(name, options.location.as_deref()).await?;
        let _guard = self.lock(&dir).await?;
        if dir.exists() {
            return Err(VmError::AlreadyExists(name.to_string()));
        }

        let image = match &options.source {
            VmSource::Image(reference) => Some(self.puller()?.ensure_image(reference, cancel).await?),
            _ => None,
        };
        let config = self.initial_config(&options, image.as_ref()).await?;
        if let VmSource::Installer(_) = &options.source {
            if !config.os.requires_platform_identity() {
                return Err(VmError::InvalidConfigValue(
                    "installers are only used for macOS guests; create a blank VM and run it with --iso".to_string(),
                ));
            }
        }

        let staging = self.storage.staging_path(&dir);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| VmError::FileCreationFailed {
                path: staging.clone(),
                reason: e.to_string(),
            })?;
        let staged = dir.at(staging.clone());
        debug!(vm = %name, staging = %staging.display(), "Staging new VM");

        let populated = self
            .populate(&staged, config, &options.source, image.as_ref(), cancel)
            .await;
        if let Err(e) = populated {
            discard(&staging).await;
            return Err(e);
        }
        if cancel.is_cancelled() {
            discard(&staging).await;
            return Err(VmError::Cancelled);
        }
        publish(&staging, &dir).await?;

        info!(vm = %name, location = %dir.location(), "VM created");
        self.details(&dir).await
    }

    async fn initial_config(&self, options: &CreateOptions, image: Option<&ImageRecord>) -> VmResult<VmConfig> {
        let template = match image {
            Some(record) => {
                let path = self.puller()?.index().config_path(&record.reference);
                VmConfigTemplate::load(&path).await?.unwrap_or_default()
            }
            None => VmConfigTemplate::default(),
        };

        let disk_size = match (image, options.disk_size) {
            (Some(record), Some(requested)) if requested < record.uncompressed_size => {
                return Err(VmError::ResizeTooSmall {
                    current: record.uncompressed_size,
                    requested,
                });
            }
            (_, Some(requested)) => requested,
            (Some(record), None) => template
                .disk_size
                .unwrap_or(record.uncompressed_size)
                .max(record.uncompressed_size),
            (None, None) => self.defaults.disk_size,
        };
        let display = match options.display.or(template.display) {
            Some(display) => display,
            None => self.defaults.display.parse()?,
        };

        let mut config = VmConfig::new(
            options.os.or(template.os).unwrap_or(OsKind::Linux),
            options.cpu_count.or(template.cpu_count).unwrap_or(self.defaults.cpu_count),
            options.memory_size.or(template.memory_size).unwrap_or(self.defaults.memory),
            disk_size,
            display,
        );
        config.hardware_model = template.hardware_model;
        config.machine_identifier = template.machine_identifier;
        config.validate()?;
        Ok(config)
    }

    /// Fill a staging directory with config, disk and nvram.
    async fn populate(
        &self,
        staged: &VmDirectory,
        mut config: VmConfig,
        source: &VmSource,
        image: Option<&ImageRecord>,
        cancel: &CancelToken,
    ) -> VmResult<()> {
        match (source, image) {
            (VmSource::Image(_), Some(record)) => {
                let index = self.puller()?.index();
                disk::copy_sparse(&index.disk_path(&record.reference), &staged.disk_path()).await?;
                disk::grow_to(&staged.disk_path(), config.disk_size).await?;
                if record.has_nvram {
                    let src = index.nvram_path(&record.reference);
                    tokio::fs::copy(&src, staged.nvram_path())
                        .await
                        .map_err(|e| VmError::io(&src, e))?;
                } else {
                    self.hypervisor
                        .create_nvram(&staged.nvram_path())
                        .await
                        .map_err(|e| VmError::hypervisor("create_nvram", e))?;
                }
            }
            (VmSource::Installer(installer), _) => {
                disk::set_size(&staged.disk_path(), config.disk_size).await?;
                let vm = staged.name().to_string();
                let progress: ProgressFn = Arc::new(move |fraction| {
                    debug!(vm = %vm, progress = format!("{:.0}%", fraction * 100.0), "Install progress");
                });
                let identity = self
                    .hypervisor
                    .install(staged, &config, installer, progress, cancel)
                    .await
                    .map_err(|e| {
                        if cancel.is_cancelled() {
                            VmError::Cancelled
                        } else {
                            VmError::hypervisor("install", e)
                        }
                    })?;
                config.hardware_model = Some(identity.hardware_model);
                config.machine_identifier = Some(identity.machine_identifier);
            }
            _ => {
                disk::set_size(&staged.disk_path(), config.disk_size).await?;
                self.hypervisor
                    .create_nvram(&staged.nvram_path())
                    .await
                    .map_err(|e| VmError::hypervisor("create_nvram", e))?;
            }
        }
        config.save(staged).await
    }

    // ---- run / stop / pause / resume ---------------------------------------

    pub async fn run(&self, name: &str, options: RunOptions, cancel: &CancelToken) -> VmResult<VmDetails> {
        let started = Instant::now();
        let result = self.run_inner(name, options, cancel).await;
        finish("run", name, started, &result);
        result
    }

    async fn run_inner(&self, name: &str, options: RunOptions, cancel: &CancelToken) -> VmResult<VmDetails> {
        if let Some(image) = &options.image {
            let candidate = self.resolve_new(name, options.location.as_deref()).await?;
            if !candidate.exists() {
                let create = CreateOptions {
                    location: options.location.clone(),
                    source: VmSource::Image(image.clone()),
                    ..Default::default()
                };
                match self.create(name, create, cancel).await {
                    Ok(_) | Err(VmError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let dir = self.storage.existing(name, options.location.as_deref())?;
        let _guard = self.lock(&dir).await?;
        if !dir.initialized() {
            return Err(VmError::NotInitialized(name.to_string()));
        }
        let config = VmConfig::load(&dir).await?;
        if !config.has_platform_identity() {
            return Err(VmError::InstallNotStarted(name.to_string()));
        }
        match self.runtime_state(&dir).await? {
            RuntimeState::Stopped => {}
            _ => return Err(VmError::AlreadyRunning(name.to_string())),
        }

        let lease = self
            .locks
            .acquire_lease(name, &self.storage.lease_path(&dir))
            .await?;
        let start = StartOptions {
            graphics: options.display,
            iso: options.iso.clone(),
            shared_directories: options.shared_directories.clone(),
        };
        self.hypervisor
            .start(&dir, &config, &start)
            .await
            .map_err(|e| VmError::hypervisor("start", e))?;
        self.local_runs().insert(
            dir.path().to_path_buf(),
            LocalRun {
                dir: dir.clone(),
                _lease: lease,
            },
        );
        metrics::RUNNING_VMS.inc();
        info!(vm = %name, hypervisor = %self.hypervisor.name(), "VM started");

        if options.display {
            if let Err(e) = self.start_display(&dir, &options).await {
                self.abort_run(&dir).await;
                return Err(e);
            }
        }
        self.details(&dir).await
    }

    async fn start_display(&self, dir: &VmDirectory, options: &RunOptions) -> VmResult<()> {
        let endpoint: Option<SocketAddr> = self
            .hypervisor
            .display_endpoint(dir)
            .await
            .map_err(|e| VmError::hypervisor("display_endpoint", e))?;
        let Some(target) = endpoint else {
            warn!(vm = %dir.name(), "Hypervisor exposes no display endpoint; running without a display session");
            return Ok(());
        };

        let url = match self.display.start(dir.name(), target, options.display_port).await {
            Ok(url) => url,
            Err(DisplayError::Unavailable(reason)) => {
                warn!(vm = %dir.name(), reason = %reason, "Display unavailable; running without a display session");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let session = DisplaySession::new(url.clone(), options.shared_directories.clone());
        if let Err(e) = session.save(dir).await {
            let _ = self.display.stop(dir.name()).await;
            return Err(e);
        }
        info!(vm = %dir.name(), url = %url, "Display session started");

        if options.open_client {
            if let Err(e) = self.display.open_client(&url).await {
                warn!(vm = %dir.name(), error = %e, "Failed to open display client");
            }
        }
        Ok(())
    }

    /// Best-effort stop after a run failed half way.
    async fn abort_run(&self, dir: &VmDirectory) {
        let timeout = self.stop_timeout();
        match tokio::time::timeout(timeout, self.hypervisor.stop(dir)).await {
            Ok(Ok(())) => {
                metrics::RUNNING_VMS.dec();
                self.release(dir);
            }
            Ok(Err(e)) => warn!(vm = %dir.name(), error = %e, "Best-effort stop failed"),
            Err(_) => warn!(vm = %dir.name(), "Best-effort stop timed out"),
        }
        let _ = DisplaySession::clear(dir).await;
    }

    pub async fn stop(&self, name: &str, location: Option<&str>) -> VmResult<VmDetails> {
        let started = Instant::now();
        let result = self.stop_inner(name, location).await;
        finish("stop", name, started, &result);
        result
    }

    async fn stop_inner(&self, name: &str, location: Option<&str>) -> VmResult<VmDetails> {
        let dir = self.storage.existing(name, location)?;
        self.stop_dir(&dir).await
    }

    async fn stop_dir(&self, dir: &VmDirectory) -> VmResult<VmDetails> {
        let name = dir.name();
        let _guard = self.lock(dir).await?;
        match self.owner(dir).await? {
            Owner::Here(_) => {}
            Owner::Elsewhere => return Err(VmError::RunningElsewhere(name.to_string())),
            Owner::Nobody => return Err(VmError::NotRunning(name.to_string())),
        }

        let timeout = self.stop_timeout();
        match tokio::time::timeout(timeout, self.hypervisor.stop(dir)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(VmError::hypervisor("stop", e)),
            Err(_) => {
                return Err(VmError::StopTimeout {
                    name: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
        if metrics::RUNNING_VMS.get() > 0 {
            metrics::RUNNING_VMS.dec();
        }
        self.release(dir);

        if let Err(e) = self.display.stop(name).await {
            warn!(vm = %name, error = %e, "Failed to stop display session");
        }
        DisplaySession::clear(dir).await?;
        info!(vm = %name, "VM stopped");
        self.details(dir).await
    }

    /// Best-effort stop of every VM this process started. Called when the
    /// serving process exits so no hypervisor child outlives it.
    pub async fn shutdown(&self) {
        let dirs: Vec<VmDirectory> = self.local_runs().values().map(|run| run.dir.clone()).collect();
        for dir in dirs {
            let started = Instant::now();
            let result = self.stop_dir(&dir).await;
            finish("stop", dir.name(), started, &result);
            match result {
                Ok(_) | Err(VmError::NotRunning(_)) => {}
                Err(e) => warn!(vm = %dir.name(), error = %e, "Failed to stop VM on shutdown"),
            }
        }
    }

    pub async fn pause(&self, name: &str, location: Option<&str>) -> VmResult<VmDetails> {
        let started = Instant::now();
        let result: VmResult<VmDetails> = async {
            let dir = self.storage.existing(name, location)?;
            let _guard = self.lock(&dir).await?;
            match self.owner(&dir).await? {
                Owner::Here(RuntimeState::Running) => {}
                Owner::Elsewhere => return Err(VmError::RunningElsewhere(name.to_string())),
                _ => return Err(VmError::NotRunning(name.to_string())),
            }
            self.hypervisor
                .pause(&dir)
                .await
                .map_err(|e| VmError::hypervisor("pause", e))?;
            info!(vm = %name, "VM paused");
            self.details(&dir).await
        }
        .await;
        finish("pause", name, started, &result);
        result
    }

    pub async fn resume(&self, name: &str, location: Option<&str>) -> VmResult<VmDetails> {
        let started = Instant::now();
        let result: VmResult<VmDetails> = async {
            let dir = self.storage.existing(name, location)?;
            let _guard = self.lock(&dir).await?;
            match self.owner(&dir).await? {
                Owner::Here(RuntimeState::Paused) => {}
                Owner::Elsewhere => return Err(VmError::RunningElsewhere(name.to_string())),
                _ => return Err(VmError::NotPaused(name.to_string())),
            }
            self.hypervisor
                .resume(&dir)
                .await
                .map_err(|e| VmError::hypervisor("resume", e))?;
            info!(vm = %name, "VM resumed");
            self.details(&dir).await
        }
        .await;
        finish("resume", name, started, &result);
        result
    }

    // ---- settings / clone / delete -----------------------------------------

    pub async fn update_settings(
        &self,
        name: &str,
        location: Option<&str>,
        update: &VmConfigUpdate,
    ) -> VmResult<VmConfig> {
        let started = Instant::now();
        let result: VmResult<VmConfig> = async {
            let dir = self.storage.existing(name, location)?;
            let _guard = self.lock(&dir).await?;
            self.require_stopped(&dir, "set").await?;

            let mut config = VmConfig::load(&dir).await?;
            if update.is_empty() {
                return Ok(config);
            }
            let previous_disk = config.disk_size;
            update.apply(&mut config)?;
            if config.disk_size > previous_disk {
                disk::grow_to(&dir.disk_path(), config.disk_size).await?;
            }
            config.save(&dir).await?;
            info!(vm = %name, ?update, "VM settings updated");
            Ok(config)
        }
        .await;
        finish("set", name, started, &result);
        result
    }

    /// Copy `source` into a new independent VM `destination`.
    ///
    /// The source may be running; its files are only read. The copy gets a
    /// fresh MAC address.
    pub async fn clone_vm(
        &self,
        source: &str,
        destination: &str,
        source_location: Option<&str>,
        destination_location: Option<&str>,
    ) -> VmResult<VmDetails> {
        let started = Instant::now();
        let result = self
            .clone_inner(source, destination, source_location, destination_location)
            .await;
        finish("clone", destination, started, &result);
        result
    }

    async fn clone_inner(
        &self,
        source: &str,
        destination: &str,
        source_location: Option<&str>,
        destination_location: Option<&str>,
    ) -> VmResult<VmDetails> {
        let src = self.storage.existing(source, source_location)?;
        let dst = self.resolve_new(destination, destination_location).await?;
        if src.path() == dst.path() {
            return Err(VmError::AlreadyExists(destination.to_string()));
        }

        // lock in path order so two crossing clones cannot deadlock
        let (first, second) = if self.storage.lock_path(&src) <= self.storage.lock_path(&dst) {
            (&src, &dst)
        } else {
            (&dst, &src)
        };
        let _first = self.lock(first).await?;
        let _second = self.lock(second).await?;

        if !src.initialized() {
            return Err(VmError::NotInitialized(source.to_string()));
        }
        if dst.exists() {
            return Err(VmError::AlreadyExists(destination.to_string()));
        }

        let staging = self.storage.staging_path(&dst);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| VmError::FileCreationFailed {
                path: staging.clone(),
                reason: e.to_string(),
            })?;
        let staged = dst.at(staging.clone());

        let copied = async {
            let mut config = VmConfig::load(&src).await?;
            config.mac_address = random_mac_address();
            let bytes = disk::copy_sparse(&src.disk_path(), &staged.disk_path()).await?;
            tokio::fs::copy(src.nvram_path(), staged.nvram_path())
                .await
                .map_err(|e| VmError::io(src.nvram_path(), e))?;
            config.save(&staged).await?;
            Ok::<_, VmError>(bytes)
        }
        .await;
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(&staging).await;
                return Err(e);
            }
        };
        publish(&staging, &dst).await?;

        info!(source = %source, destination = %destination, disk_bytes = bytes, "VM cloned");
        self.details(&dst).await
    }

    pub async fn delete(&self, name: &str, location: Option<&str>) -> VmResult<()> {
        let started = Instant::now();
        let result: VmResult<()> = async {
            let dir = self.storage.existing(name, location)?;
            let _guard = self.lock(&dir).await?;
            self.require_stopped(&dir, "delete").await?;
            if let Err(e) = self.display.stop(name).await {
                debug!(vm = %name, error = %e, "No display session to stop");
            }
            dir.delete().await?;
            info!(vm = %name, location = %dir.location(), "VM deleted");
            Ok(())
        }
        .await;
        finish("delete", name, started, &result);
        result
    }

    // ---- reads ---------------------------------------------------------------

    pub async fn get(&self, name: &str, location: Option<&str>) -> VmResult<VmDetails> {
        let dir = self.storage.existing(name, location)?;
        self.details(&dir).await
    }

    /// Every VM across all locations. Directories with unreadable
    /// configuration are skipped with a warning.
    pub async fn list(&self) -> VmResult<Vec<VmDetails>> {
        let mut vms = Vec::new();
        for dir in self.storage.list().await? {
            match self.details(&dir).await {
                Ok(details) => vms.push(details),
                Err(e) => warn!(vm = %dir.name(), location = %dir.location(), error = %e, "Skipping VM"),
            }
        }
        Ok(vms)
    }

    pub async fn latest_restore_image_url(&self) -> VmResult<String> {
        self.hypervisor
            .latest_restore_image_url()
            .await
            .map_err(|e| VmError::hypervisor("latest_restore_image_url", e))
    }

    // ---- images ----------------------------------------------------------------

    /// Pull `reference`, then optionally materialize VM `name` from it.
    pub async fn pull(
        &self,
        reference: &str,
        name: Option<&str>,
        location: Option<&str>,
        cancel: &CancelToken,
    ) -> VmResult<(ImageRecord, Option<VmDetails>)> {
        let record = self.puller()?.pull(reference, cancel).await?;
        let vm = match name {
            Some(name) => {
                let options = CreateOptions {
                    location: location.map(str::to_string),
                    source: VmSource::Image(reference.to_string()),
                    ..Default::default()
                };
                Some(self.create(name, options, cancel).await?)
            }
            None => None,
        };
        Ok((record, vm))
    }

    // ---- helpers -----------------------------------------------------------------

    async fn details(&self, dir: &VmDirectory) -> VmResult<VmDetails> {
        let config = VmConfig::load(dir).await?;
        let state = self.runtime_state(dir).await?;
        let display_url = if state == RuntimeState::Stopped {
            None
        } else {
            DisplaySession::load(dir).await?.map(|s| s.url)
        };
        let disk_usage = match dir.disk_usage() {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!(vm = %dir.name(), error = %e, "Disk usage unavailable");
                None
            }
        };
        Ok(VmDetails {
            name: dir.name().to_string(),
            location: dir.location().to_string(),
            path: dir.path().to_path_buf(),
            config,
            state,
            display_url,
            disk_usage,
        })
    }

    async fn runtime_state(&self, dir: &VmDirectory) -> VmResult<RuntimeState> {
        Ok(match self.owner(dir).await? {
            Owner::Here(state) => state,
            Owner::Elsewhere => RuntimeState::Running,
            Owner::Nobody => RuntimeState::Stopped,
        })
    }

    async fn owner(&self, dir: &VmDirectory) -> VmResult<Owner> {
        let state = self
            .hypervisor
            .state(dir)
            .await
            .map_err(|e| VmError::hypervisor("state", e))?;
        if state != RuntimeState::Stopped {
            return Ok(Owner::Here(state));
        }
        if self.release(dir) {
            info!(vm = %dir.name(), "VM shut down from inside the guest");
            if metrics::RUNNING_VMS.get() > 0 {
                metrics::RUNNING_VMS.dec();
            }
        }
        if lock::lease_held(&self.storage.lease_path(dir))? {
            Ok(Owner::Elsewhere)
        } else {
            Ok(Owner::Nobody)
        }
    }

    fn local_runs(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, LocalRun>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop this process's run lease for `dir`. Returns whether one was held.
    fn release(&self, dir: &VmDirectory) -> bool {
        self.local_runs().remove(dir.path()).is_some()
    }

    async fn require_stopped(&self, dir: &VmDirectory, operation: &'static str) -> VmResult<()> {
        match self.runtime_state(dir).await? {
            RuntimeState::Stopped => Ok(()),
            state => Err(VmError::MustBeStopped {
                name: dir.name().to_string(),
                state: state.to_string(),
                operation,
            }),
        }
    }

    async fn resolve_new(&self, name: &str, location: Option<&str>) -> VmResult<VmDirectory> {
        if location.is_none() {
            self.storage.ensure_default_root().await?;
        }
        self.storage.resolve(name, location)
    }

    async fn lock(&self, dir: &VmDirectory) -> VmResult<VmGuard> {
        self.locks
            .acquire(dir.name(), &self.storage.lock_path(dir))
            .await
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.stop_timeout_secs)
    }
}

fn finish<T>(operation: &str, name: &str, started: Instant, result: &VmResult<T>) {
    let elapsed = started.elapsed().as_secs_f64();
    metrics::record_operation(operation, result.is_ok(), elapsed);
    if let Err(e) = result {
        debug!(vm = %name, operation, error = %e, "Operation failed");
    }
}

async fn publish(staging: &Path, dir: &VmDirectory) -> VmResult<()> {
    if let Err(e) = tokio::fs::rename(staging, dir.path()).await {
        discard(staging).await;
        if dir.exists() {
            return Err(VmError::AlreadyExists(dir.name().to_string()));
        }
        return Err(VmError::io(dir.path(), e));
    }
    Ok(())
}

async fn discard(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{GB, MB};
    use crate::vm::display::MockDisplay;
    use crate::vm::mock::MockHypervisor;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        controller: Controller,
        hypervisor: Arc<MockHypervisor>,
        display: Arc<MockDisplay>,
    }

    fn fixture_with(hypervisor: MockHypervisor) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let hypervisor = Arc::new(hypervisor);
        let display = Arc::new(MockDisplay::new());
        let defaults = VmDefaults {
            stop_timeout_secs: 1,
            lock_timeout_secs: 1,
            disk_size: 64 * MB,
            memory: GB,
            ..Default::default()
        };
        let controller = Controller::new(
            StorageLayout::single(tmp.path().join("vms")),
            hypervisor.clone(),
            display.clone(),
            defaults,
        );
        Fixture {
            tmp,
            controller,
            hypervisor,
            display,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockHypervisor::new())
    }

    /// A second controller over the same storage, standing in for another process.
    fn peer(f: &Fixture) -> Controller {
        Controller::new(
            StorageLayout::single(f.tmp.path().join("vms")),
            Arc::new(MockHypervisor::new()),
            Arc::new(MockDisplay::new()),
            VmDefaults {
                stop_timeout_secs: 1,
                lock_timeout_secs: 1,
                disk_size: 64 * MB,
                memory: GB,
                ..Default::default()
            },
        )
    }

    fn small() -> CreateOptions {
        CreateOptions {
            cpu_count: Some(2),
            memory_size: Some(GB),
            disk_size: Some(32 * MB),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_already_exists() {
        let f = fixture();
        let details = f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        assert_eq!(details.state, RuntimeState::Stopped);
        assert_eq!(details.config.cpu_count, 2);
        assert_eq!(std::fs::metadata(details.path.join("disk.img")).unwrap().len(), 32 * MB);

        let err = f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_uses_defaults() {
        let f = fixture();
        let details = f
            .controller
            .create("vm1", CreateOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(details.config.cpu_count, 4);
        assert_eq!(details.config.disk_size, 64 * MB);
        assert_eq!(details.config.display, Resolution::default());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing() {
        let f = fixture();
        f.hypervisor.fail_on("create_nvram");
        let err = f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, VmError::Hypervisor { operation: "create_nvram", .. }));
        assert!(f.controller.list().await.unwrap().is_empty());
        let root = f.controller.storage().location_root(None).unwrap().1;
        let leftovers: Vec<_> = std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_installer_sets_identity() {
        let f = fixture();
        let options = CreateOptions {
            os: Some(OsKind::MacOs),
            source: VmSource::Installer(PathBuf::from("/restore.ipsw")),
            ..small()
        };
        let details = f.controller.create("mac", options, &CancelToken::new()).await.unwrap();
        assert!(details.config.has_platform_identity());
        assert_eq!(f.hypervisor.call_count("install"), 1);
    }

    #[tokio::test]
    async fn test_blank_macos_is_install_not_started() {
        let f = fixture();
        let options = CreateOptions {
            os: Some(OsKind::MacOs),
            ..small()
        };
        f.controller.create("mac", options, &CancelToken::new()).await.unwrap();
        let err = f
            .controller
            .run("mac", RunOptions::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::InstallNotStarted(_)));
    }

    #[tokio::test]
    async fn test_run_stop_transitions() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();

        let running = f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
        assert_eq!(running.state, RuntimeState::Running);
        assert!(running.display_url.is_some());

        let err = f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyRunning(_)));

        let stopped = f.controller.stop("vm1", None).await.unwrap();
        assert_eq!(stopped.state, RuntimeState::Stopped);
        assert!(stopped.display_url.is_none());
        assert!(f.display.active_url("vm1").is_none());

        let err = f.controller.stop("vm1", None).await.unwrap_err();
        assert!(matches!(err, VmError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_run_not_initialized() {
        let f = fixture();
        let details = f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        std::fs::remove_file(details.path.join("nvram.bin")).unwrap();
        let err = f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, VmError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_display_port_in_use_stops_vm() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        f.display.occupy(5999);
        let options = RunOptions {
            display_port: Some(5999),
            ..Default::default()
        };
        let err = f.controller.run("vm1", options, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            VmError::Display(DisplayError::PortInUse { port: 5999, suggested: 6000 })
        ));
        let details = f.controller.get("vm1", None).await.unwrap();
        assert_eq!(details.state, RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn test_headless_hypervisor_runs_without_session() {
        let f = fixture_with(MockHypervisor::headless());
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        let details = f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
        assert_eq!(details.state, RuntimeState::Running);
        assert!(details.display_url.is_none());
    }

    #[tokio::test]
    async fn test_stop_timeout_is_reported() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
        f.hypervisor.set_stop_delay(Some(Duration::from_secs(5)));

        let err = f.controller.stop("vm1", None).await.unwrap_err();
        assert!(matches!(err, VmError::StopTimeout { timeout_secs: 1, .. }));
        assert_eq!(f.controller.get("vm1", None).await.unwrap().state, RuntimeState::Running);
    }

    #[tokio::test]
    async fn test_pause_resume_guards() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        assert!(matches!(f.controller.pause("vm1", None).await, Err(VmError::NotRunning(_))));
        assert!(matches!(f.controller.resume("vm1", None).await, Err(VmError::NotPaused(_))));

        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
        assert_eq!(f.controller.pause("vm1", None).await.unwrap().state, RuntimeState::Paused);
        assert!(matches!(
            f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await,
            Err(VmError::AlreadyRunning(_))
        ));
        assert_eq!(f.controller.resume("vm1", None).await.unwrap().state, RuntimeState::Running);
    }

    #[tokio::test]
    async fn test_update_settings() {
        let f = fixture();
        let details = f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();

        let grow = VmConfigUpdate {
            cpu_count: Some(6),
            disk_size: Some(48 * MB),
            ..Default::default()
        };
        let config = f.controller.update_settings("vm1", None, &grow).await.unwrap();
        assert_eq!(config.cpu_count, 6);
        assert_eq!(std::fs::metadata(details.path.join("disk.img")).unwrap().len(), 48 * MB);

        let shrink = VmConfigUpdate {
            disk_size: Some(16 * MB),
            ..Default::default()
        };
        let err = f.controller.update_settings("vm1", None, &shrink).await.unwrap_err();
        assert!(matches!(err, VmError::ResizeTooSmall { current, requested } if current == 48 * MB && requested == 16 * MB));
        assert_eq!(f.controller.get("vm1", None).await.unwrap().config.disk_size, 48 * MB);

        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
        let err = f.controller.update_settings("vm1", None, &grow).await.unwrap_err();
        assert!(matches!(err, VmError::MustBeStopped { operation: "set", .. }));
    }

    #[tokio::test]
    async fn test_clone_is_independent() {
        let f = fixture();
        let source = f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        std::fs::write(source.path.join("disk.img"), vec![7u8; 4096]).unwrap();

        let copy = f.controller.clone_vm("vm1", "vm2", None, None).await.unwrap();
        assert_eq!(copy.config.cpu_count, source.config.cpu_count);
        assert_ne!(copy.config.mac_address, source.config.mac_address);

        std::fs::write(source.path.join("disk.img"), vec![9u8; 4096]).unwrap();
        assert_eq!(std::fs::read(copy.path.join("disk.img")).unwrap(), vec![7u8; 4096]);

        let err = f.controller.clone_vm("vm1", "vm2", None, None).await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists(_)));
        let err = f.controller.clone_vm("missing", "vm3", None, None).await.unwrap_err();
        assert!(matches!(err, VmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_requires_stopped() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
        let err = f.controller.delete("vm1", None).await.unwrap_err();
        assert!(matches!(err, VmError::MustBeStopped { operation: "delete", .. }));

        f.controller.stop("vm1", None).await.unwrap();
        f.controller.delete("vm1", None).await.unwrap();
        assert!(matches!(f.controller.get("vm1", None).await, Err(VmError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_serialized() {
        let f = Arc::new(fixture());
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();

        let stops: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move { f.controller.stop("vm1", None).await })
            })
            .collect();
        let mut ok = 0;
        for stop in stops {
            match stop.await.unwrap() {
                Ok(_) => ok += 1,
                Err(VmError::NotRunning(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(f.hypervisor.call_count("stop"), 1);
    }

    #[tokio::test]
    async fn test_pull_requires_registry() {
        let f = fixture();
        let err = f
            .controller
            .pull("img", None, None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfigValue(_)));
    }

    #[tokio::test]
    async fn test_vm_running_in_another_process_is_protected() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        let running = f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();

        let other = peer(&f);
        let seen = other.get("vm1", None).await.unwrap();
        assert_eq!(seen.state, RuntimeState::Running);
        assert_eq!(seen.display_url, running.display_url);

        let update = VmConfigUpdate {
            cpu_count: Some(8),
            ..Default::default()
        };
        let err = other.update_settings("vm1", None, &update).await.unwrap_err();
        assert!(matches!(err, VmError::MustBeStopped { .. }), "got {err:?}");
        let err = other.delete("vm1", None).await.unwrap_err();
        assert!(matches!(err, VmError::MustBeStopped { .. }), "got {err:?}");
        assert!(running.path.join("config.json").exists());

        let err = other.stop("vm1", None).await.unwrap_err();
        assert!(matches!(err, VmError::RunningElsewhere(_)));
        let err = other.pause("vm1", None).await.unwrap_err();
        assert!(matches!(err, VmError::RunningElsewhere(_)));
        let headless = RunOptions {
            display: false,
            ..Default::default()
        };
        let err = other.run("vm1", headless, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyRunning(_)));

        f.controller.stop("vm1", None).await.unwrap();
        assert_eq!(other.get("vm1", None).await.unwrap().state, RuntimeState::Stopped);
        let updated = other.update_settings("vm1", None, &update).await.unwrap();
        assert_eq!(updated.cpu_count, 8);
    }

    #[tokio::test]
    async fn test_guest_shutdown_releases_run_lease() {
        let f = fixture();
        f.controller.create("vm1", small(), &CancelToken::new()).await.unwrap();
        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();

        let dir = f.controller.storage.existing("vm1", None).unwrap();
        f.hypervisor.set_state(&dir, RuntimeState::Stopped);

        assert_eq!(f.controller.get("vm1", None).await.unwrap().state, RuntimeState::Stopped);
        assert_eq!(peer(&f).get("vm1", None).await.unwrap().state, RuntimeState::Stopped);
        f.controller.run("vm1", RunOptions::default(), &CancelToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_local_vms() {
        let f = fixture();
        for name in ["vm1", "vm2"] {
            f.controller.create(name, small(), &CancelToken::new()).await.unwrap();
            let options = RunOptions {
                display: false,
                ..Default::default()
            };
            f.controller.run(name, options, &CancelToken::new()).await.unwrap();
        }

        f.controller.shutdown().await;

        assert_eq!(f.hypervisor.call_count("stop"), 2);
        for name in ["vm1", "vm2"] {
            assert_eq!(f.controller.get(name, None).await.unwrap().state, RuntimeState::Stopped);
        }
        assert_eq!(peer(&f).get("vm1", None).await.unwrap().state, RuntimeState::Stopped);

        // nothing left to stop
        f.controller.shutdown().await;
        assert_eq!(f.hypervisor.call_count("stop"), 2);
    }
}
