// Image Distribution Client
//
// pull(reference):
//   1. parse `name[:tag]`                       InvalidImageFormat, no network
//   2. token                                     TokenFetchFailed
//   3. manifest + image config document          ManifestFetchFailed
//      uncompressed-size annotation              MissingUncompressedSizeAnnotation
//   4. every part through the content cache      LayerDownloadFailed / DecompressionFailed
//   5. reassemble into the image store           MissingPart / ReassemblyFailed
//   6. write the index record last
//
// Pulls of the same reference are serialized; different references run in
// parallel, sharing the cache's download limit. `prune` excludes all pulls
// while it runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::metrics;
use crate::registry::assemble::reassemble;
use crate::registry::cache::{BlobKind, ContentCache, FetchOutcome};
use crate::registry::error::{PullError, PullResult};
use crate::registry::index::{ImageIndex, ImageRecord, IMAGE_CONFIG_FILE, IMAGE_DISK_FILE, IMAGE_NVRAM_FILE};
use crate::registry::manifest::{uncompressed_size, ImageLayout};
use crate::registry::reference::ImageReference;
use crate::registry::transport::{HttpRegistry, RegistryTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Resolving,
    Downloading,
    Reassembling,
    Ready,
    Failed,
    Cancelled,
}

/// Progress of one pull, kept after it finishes until the next pull of the
/// same reference.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullJob {
    pub reference: String,
    pub state: JobState,
    pub total_parts: u32,
    pub cached_parts: Vec<u32>,
    pub downloading_parts: Vec<u32>,
    pub target: Option<PathBuf>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PullJob {
    fn new(reference: String) -> Self {
        let now = Utc::now();
        Self {
            reference,
            state: JobState::Resolving,
            total_parts: 0,
            cached_parts: Vec::new(),
            downloading_parts: Vec::new(),
            target: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub removed_images: usize,
    pub removed_blobs: usize,
    pub removed_temp_files: usize,
    pub reclaimed_bytes: u64,
}

pub struct Puller {
    transport: Arc<dyn RegistryTransport>,
    cache: Arc<ContentCache>,
    index: ImageIndex,
    organization: String,
    jobs: Mutex<HashMap<String, PullJob>>,
    references: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    maintenance: RwLock<()>,
}

impl Puller {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        cache_root: &Path,
        organization: impl Into<String>,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            transport,
            cache: Arc::new(ContentCache::new(cache_root, max_concurrent_downloads)),
            index: ImageIndex::new(cache_root),
            organization: organization.into(),
            jobs: Mutex::new(HashMap::new()),
            references: Mutex::new(HashMap::new()),
            maintenance: RwLock::new(()),
        }
    }

    /// A puller talking HTTP to the configured registry.
    pub fn from_settings(settings: &Settings) -> PullResult<Self> {
        let transport = HttpRegistry::new(&settings.registry)?;
        Ok(Self::new(
            Arc::new(transport),
            &settings.cache_dir(),
            settings.registry.organization.clone(),
            settings.registry.max_concurrent_downloads,
        ))
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Snapshot of all known pull jobs, oldest first.
    pub fn jobs(&self) -> Vec<PullJob> {
        let mut jobs: Vec<PullJob> = self.jobs_map().values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    pub async fn images(&self) -> PullResult<Vec<ImageRecord>> {
        self.index.list().await
    }

    /// The locally stored image for `reference`, without touching the network.
    pub async fn local_image(&self, reference: &str) -> PullResult<Option<ImageRecord>> {
        let reference = ImageReference::parse(reference)?;
        self.index.get_complete(&reference).await
    }

    /// Like `local_image`, failing with `ImageNotFound` when absent.
    pub async fn image(&self, reference: &str) -> PullResult<ImageRecord> {
        self.local_image(reference)
            .await?
            .ok_or_else(|| PullError::ImageNotFound(reference.to_string()))
    }

    /// Return a local image, pulling it first when absent.
    pub async fn ensure_image(&self, reference: &str, cancel: &CancelToken) -> PullResult<ImageRecord> {
        match self.local_image(reference).await? {
            Some(record) => Ok(record),
            None => self.pull(reference, cancel).await,
        }
    }

    /// Pull `reference` into the local image store.
    pub async fn pull(&self, reference: &str, cancel: &CancelToken) -> PullResult<ImageRecord> {
        let reference = ImageReference::parse(reference)?;
        let key = reference.to_string();

        let lock = self.reference_lock(&key);
        let _serial = lock.lock().await;
        let _shared = self.maintenance.read().await;

        self.jobs_map().insert(key.clone(), PullJob::new(key.clone()));
        metrics::ACTIVE_PULLS.inc();
        let started = Instant::now();

        let result = self.pull_locked(&reference, &key, cancel).await;

        metrics::ACTIVE_PULLS.dec();
        metrics::PULL_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(record) => {
                metrics::PULLS_TOTAL.with_label_values(&["success"]).inc();
                info!(image = %key, size = record.uncompressed_size, "Image ready");
                self.update_job(&key, |job| {
                    job.state = JobState::Ready;
                    job.downloading_parts.clear();
                });
            }
            Err(e) => {
                let (state, label) = if matches!(e, PullError::Cancelled) {
                    (JobState::Cancelled, "cancelled")
                } else {
                    (JobState::Failed, "failure")
                };
                metrics::PULLS_TOTAL.with_label_values(&[label]).inc();
                warn!(image = %key, error = %e, "Pull failed");
                let message = e.to_string();
                self.update_job(&key, |job| {
                    job.state = state;
                    job.error = Some(message);
                    job.downloading_parts.clear();
                });
            }
        }
        result
    }

    async fn pull_locked(&self, reference: &ImageReference, key: &str, cancel: &CancelToken) -> PullResult<ImageRecord> {
        let repository = reference.repository(&self.organization);

        let token = self.transport.fetch_token(&repository).await?;
        let (manifest, manifest_digest) = self
            .transport
            .fetch_manifest(&repository, &reference.tag, &token)
            .await?;

        if let Some(existing) = self.index.get_complete(reference).await? {
            if existing.manifest_digest == manifest_digest {
                info!(image = %key, "Image already up to date");
                return Ok(existing);
            }
        }

        let layout = ImageLayout::from_manifest(&manifest)?;
        let config_bytes = self
            .transport
            .fetch_blob_bytes(&repository, &manifest.config.digest, &token)
            .await?;
        let config_document: serde_json::Value = serde_json::from_slice(&config_bytes)
            .map_err(|e| PullError::ManifestFetchFailed(format!("malformed image config: {}", e)))?;
        let expected_size = uncompressed_size(&config_document, &manifest)
            .ok_or(PullError::MissingUncompressedSizeAnnotation)?;

        info!(
            image = %key,
            parts = layout.total_parts,
            compressed = layout.compressed_size(),
            uncompressed = expected_size,
            "Pulling image"
        );
        self.update_job(key, |job| {
            job.state = JobState::Downloading;
            job.total_parts = layout.total_parts;
        });

        let fetches = layout.ordered_parts().map(|part| {
            let repository = repository.as_str();
            let token = token.as_str();
            async move {
                self.update_job(key, |job| job.downloading_parts.push(part.number));
                let (info, outcome) = self
                    .cache
                    .fetch(self.transport.as_ref(), repository, token, &part.digest, BlobKind::Gzip, cancel)
                    .await?;
                match outcome {
                    FetchOutcome::Hit => metrics::BLOB_CACHE_HITS_TOTAL.inc(),
                    FetchOutcome::Downloaded => {
                        metrics::BLOB_DOWNLOADS_TOTAL.inc();
                        metrics::BLOB_BYTES_DOWNLOADED_TOTAL.inc_by(info.compressed_size);
                    }
                }
                debug!(image = %key, part = part.number, digest = %part.digest, ?outcome, "Part cached");
                self.update_job(key, |job| {
                    job.downloading_parts.retain(|n| *n != part.number);
                    job.cached_parts.push(part.number);
                    job.cached_parts.sort_unstable();
                });
                Ok::<_, PullError>(())
            }
        });
        futures::future::try_join_all(fetches).await?;

        if let Some(nvram) = &layout.nvram {
            self.cache
                .fetch(self.transport.as_ref(), &repository, &token, &nvram.digest, BlobKind::Raw, cancel)
                .await?;
        }
        let vm_config = match &layout.vm_config {
            Some(descriptor) => Some(
                self.transport
                    .fetch_blob_bytes(&repository, &descriptor.digest, &token)
                    .await?,
            ),
            None => None,
        };

        // Build the new version aside; the previous one stays usable until
        // the swap.
        let staged = self.index.staging_dir();
        let disk_path = self.index.disk_path(reference);
        self.update_job(key, |job| {
            job.state = JobState::Reassembling;
            job.target = Some(disk_path.clone());
        });
        if let Err(e) = self
            .stage(&layout, &staged, expected_size, vm_config.as_deref(), cancel)
            .await
        {
            self.index.discard(&staged).await;
            return Err(e);
        }

        let mut digests: Vec<String> = layout.ordered_parts().map(|p| p.digest.clone()).collect();
        digests.extend(layout.nvram.iter().map(|d| d.digest.clone()));
        let record = ImageRecord {
            reference: reference.clone(),
            manifest_digest,
            digests,
            uncompressed_size: expected_size,
            has_nvram: layout.nvram.is_some(),
            has_config: vm_config.is_some(),
            pulled_at: Utc::now(),
        };
        if let Err(e) = self.index.install(&record, &staged).await {
            self.index.discard(&staged).await;
            return Err(e);
        }
        Ok(record)
    }

    async fn stage(
        &self,
        layout: &ImageLayout,
        staged: &Path,
        expected_size: u64,
        vm_config: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> PullResult<()> {
        reassemble(self.cache.clone(), layout, &staged.join(IMAGE_DISK_FILE), expected_size, cancel).await?;
        if let Some(nvram) = &layout.nvram {
            let src = self.cache.blob_path(&nvram.digest)?;
            copy_into_place(&src, &staged.join(IMAGE_NVRAM_FILE)).await?;
        }
        if let Some(bytes) = vm_config {
            let dest = staged.join(IMAGE_CONFIG_FILE);
            tokio::fs::write(&dest, bytes)
                .await
                .map_err(|e| PullError::io(&dest, e))?;
        }
        Ok(())
    }

    /// Remove cached blobs no image references, stale downloads and
    /// half-written image directories. With `all`, every image goes first.
    pub async fn prune(&self, all: bool) -> PullResult<PruneReport> {
        let _exclusive = self.maintenance.write().await;

        let mut report = PruneReport::default();
        if all {
            report.removed_images = self.index.clear().await?;
        } else {
            report.removed_images = self.index.remove_incomplete().await?;
        }

        let referenced = self.index.referenced_digests().await?;
        let cache_report = self.cache.prune(&referenced).await?;
        report.removed_blobs = cache_report.removed_blobs;
        report.removed_temp_files = cache_report.removed_temp_files;
        report.reclaimed_bytes = cache_report.reclaimed_bytes;
        info!(?report, all, "Prune complete");
        Ok(report)
    }

    fn jobs_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, PullJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_job(&self, key: &str, f: impl FnOnce(&mut PullJob)) {
        if let Some(job) = self.jobs_map().get_mut(key) {
            f(job);
            job.updated_at = Utc::now();
        }
    }

    fn reference_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .references
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // only the map holds idle entries
        map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

async fn copy_into_place(src: &Path, dest: &Path) -> PullResult<()> {
    let tmp = dest.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::copy(src, &tmp)
        .await
        .map_err(|e| PullError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| PullError::io(dest, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::{MockRegistry, PublishOptions};
    use tempfile::TempDir;

    fn puller(tmp: &TempDir, registry: Arc<MockRegistry>) -> Puller {
        Puller::new(registry, tmp.path(), "vmkeeper", 4)
    }

    #[tokio::test]
    async fn test_invalid_reference_makes_no_calls() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let puller = puller(&tmp, registry.clone());

        let err = puller.pull("Bad:Ref:x", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, PullError::InvalidImageFormat { .. }));
        assert_eq!(registry.token_fetches(), 0);
        assert_eq!(registry.manifest_fetches(), 0);
    }

    #[tokio::test]
    async fn test_token_and_manifest_failures() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let puller = puller(&tmp, registry.clone());

        registry.fail_token(true);
        assert!(matches!(
            puller.pull("img", &CancelToken::new()).await,
            Err(PullError::TokenFetchFailed(_))
        ));
        registry.fail_token(false);
        assert!(matches!(
            puller.pull("img", &CancelToken::new()).await,
            Err(PullError::ManifestFetchFailed(_))
        ));
        let jobs = puller.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_missing_annotation_aborts_before_parts() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let published = registry.publish_image(
            "vmkeeper/img",
            "latest",
            &[5u8; 4096],
            1024,
            PublishOptions {
                omit_size_annotation: true,
                ..Default::default()
            },
        );
        let puller = puller(&tmp, registry.clone());

        let err = puller.pull("img", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, PullError::MissingUncompressedSizeAnnotation));
        for digest in &published.part_digests {
            assert_eq!(registry.blob_fetches(digest), 0);
        }
    }

    #[tokio::test]
    async fn test_pull_writes_image_and_job() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let disk: Vec<u8> = (0..20_000u32).map(|i| (i % 7) as u8).collect();
        registry.publish_image(
            "vmkeeper/img",
            "v1",
            &disk,
            6000,
            PublishOptions {
                nvram: Some(vec![0xaa; 64]),
                vm_config: Some(serde_json::json!({ "os": "linux", "cpuCount": 2 })),
                ..Default::default()
            },
        );
        let puller = puller(&tmp, registry.clone());

        let record = puller.pull("img:v1", &CancelToken::new()).await.unwrap();
        assert_eq!(record.uncompressed_size, disk.len() as u64);
        assert!(record.has_nvram && record.has_config);
        let reference = ImageReference::parse("img:v1").unwrap();
        assert_eq!(std::fs::read(puller.index().disk_path(&reference)).unwrap(), disk);
        assert_eq!(std::fs::read(puller.index().nvram_path(&reference)).unwrap(), vec![0xaa; 64]);
        assert!(puller.index().config_path(&reference).exists());

        let job = &puller.jobs()[0];
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.total_parts, 4);
        assert_eq!(job.cached_parts, vec![1, 2, 3, 4]);

        assert_eq!(puller.images().await.unwrap().len(), 1);
        assert!(puller.local_image("img:v1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idle_reference_locks_are_evicted() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        for tag in ["a", "b", "c", "d"] {
            registry.publish_image("vmkeeper/img", tag, &[3u8; 4000], 2000, PublishOptions::default());
        }
        let puller = puller(&tmp, registry);
        for tag in ["a", "b", "c", "d"] {
            puller.pull(&format!("img:{tag}"), &CancelToken::new()).await.unwrap();
        }
        let _held = puller.reference_lock("img:e");
        let tracked = puller.references.lock().unwrap().len();
        assert_eq!(tracked, 1);
    }

    #[tokio::test]
    async fn test_prune_all_removes_images_and_blobs() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        registry.publish_image("vmkeeper/img", "latest", &[1u8; 8000], 3000, PublishOptions::default());
        let puller = puller(&tmp, registry);
        puller.pull("img", &CancelToken::new()).await.unwrap();

        let report = puller.prune(false).await.unwrap();
        assert_eq!(report.removed_blobs, 0);

        let report = puller.prune(true).await.unwrap();
        assert_eq!(report.removed_images, 1);
        assert_eq!(report.removed_blobs, 3);
        assert!(puller.images().await.unwrap().is_empty());
    }
}
