// Content Cache
//
//   <cache>/blobs/sha256/<hex>        verified blob as fetched from the registry
//   <cache>/blobs/sha256/<hex>.json   sidecar: compressed and uncompressed length
//   <cache>/tmp/<hex>.partial         download in progress, resumable
//
// A blob is cached iff both the blob and its sidecar exist. Entries are
// published with a rename, so a given digest is written at most once and
// readers never observe a partial blob. Concurrent requests for the same
// digest share one download.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flate2::read::MultiGzDecoder;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::registry::error::{PullError, PullResult};
use crate::registry::transport::RegistryTransport;

const BLOBS_DIR: &str = "blobs/sha256";
const TMP_DIR: &str = "tmp";

/// Recorded once a blob has been verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

/// How a blob is stored and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    /// gzip stream, validated by decompressing it once
    Gzip,
    Raw,
}

/// What the cache did to satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Hit,
    Downloaded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachePruneReport {
    pub removed_blobs: usize,
    pub removed_temp_files: usize,
    pub reclaimed_bytes: u64,
}

type Flight = Arc<OnceCell<BlobInfo>>;

pub struct ContentCache {
    root: PathBuf,
    downloads: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, max_concurrent_downloads: usize) -> Self {
        Self {
            root: root.into(),
            downloads: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> PullResult<PathBuf> {
        Ok(self.root.join(BLOBS_DIR).join(digest_hex(digest)?))
    }

    fn sidecar_path(&self, digest: &str) -> PullResult<PathBuf> {
        Ok(self
            .root
            .join(BLOBS_DIR)
            .join(format!("{}.json", digest_hex(digest)?)))
    }

    fn partial_path(&self, digest: &str) -> PullResult<PathBuf> {
        Ok(self
            .root
            .join(TMP_DIR)
            .join(format!("{}.partial", digest_hex(digest)?)))
    }

    /// Cached entry for `digest`, if present and intact.
    pub async fn lookup(&self, digest: &str) -> PullResult<Option<BlobInfo>> {
        let sidecar = self.sidecar_path(digest)?;
        let blob = self.blob_path(digest)?;
        let raw = match tokio::fs::read(&sidecar).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PullError::io(&sidecar, e)),
        };
        let info: BlobInfo = match serde_json::from_slice(&raw) {
            Ok(info) => info,
            Err(e) => {
                warn!(digest = %digest, error = %e, "Discarding corrupt cache sidecar");
                return Ok(None);
            }
        };
        match tokio::fs::metadata(&blob).await {
            Ok(meta) if meta.len() == info.compressed_size => Ok(Some(info)),
            Ok(_) => {
                warn!(digest = %digest, "Cached blob length disagrees with sidecar");
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PullError::io(&blob, e)),
        }
    }

    /// Return the cached entry for `digest`, downloading it through
    /// `transport` on a miss. At most one download per digest is in flight;
    /// concurrent callers wait for it.
    pub async fn fetch(
        &self,
        transport: &dyn RegistryTransport,
        repository: &str,
        token: &str,
        digest: &str,
        kind: BlobKind,
        cancel: &CancelToken,
    ) -> PullResult<(BlobInfo, FetchOutcome)> {
        if let Some(info) = self.lookup(digest).await? {
            debug!(digest = %digest, "Cache hit");
            return Ok((info, FetchOutcome::Hit));
        }

        let flight = {
            let mut map = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(digest.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let downloaded = AtomicBool::new(false);
        let result = {
            let downloaded = &downloaded;
            flight
                .get_or_try_init(|| async move {
                    // a previous flight may have finished between lookup and here
                    if let Some(info) = self.lookup(digest).await? {
                        return Ok(info);
                    }
                    downloaded.store(true, Ordering::SeqCst);
                    self.download(transport, repository, token, digest, kind, cancel)
                        .await
                })
                .await
                .copied()
        };

        {
            let mut map = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if map.get(digest).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
                map.remove(digest);
            }
        }

        let outcome = if downloaded.load(Ordering::SeqCst) {
            FetchOutcome::Downloaded
        } else {
            FetchOutcome::Hit
        };
        result.map(|info| (info, outcome))
    }

    async fn download(
        &self,
        transport: &dyn RegistryTransport,
        repository: &str,
        token: &str,
        digest: &str,
        kind: BlobKind,
        cancel: &CancelToken,
    ) -> PullResult<BlobInfo> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PullError::Cancelled),
            permit = self.downloads.clone().acquire_owned() => {
                permit.map_err(|_| PullError::Cancelled)?
            }
        };

        let partial = self.partial_path(digest)?;
        let tmp_dir = self.root.join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| PullError::io(&tmp_dir, e))?;

        let compressed_size = self
            .download_to_partial(transport, repository, token, digest, &partial, cancel)
            .await?;

        let uncompressed_size = match kind {
            BlobKind::Raw => compressed_size,
            BlobKind::Gzip => match validate_gzip(partial.clone(), cancel.clone()).await {
                Ok(n) => n,
                Err(e) => {
                    if !matches!(e, PullError::Cancelled) {
                        let _ = tokio::fs::remove_file(&partial).await;
                    }
                    return Err(e);
                }
            },
        };

        let info = BlobInfo {
            compressed_size,
            uncompressed_size,
        };
        self.publish(digest, &partial, &info).await?;
        info!(digest = %digest, compressed = compressed_size, uncompressed = uncompressed_size, "Cached blob");
        Ok(info)
    }

    /// Stream the blob into `partial`, resuming from what is already there.
    /// Verifies the sha256 digest; a mismatching partial is deleted, a
    /// cancelled one is kept for the next attempt.
    async fn download_to_partial(
        &self,
        transport: &dyn RegistryTransport,
        repository: &str,
        token: &str,
        digest: &str,
        partial: &Path,
        cancel: &CancelToken,
    ) -> PullResult<u64> {
        let existing = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let blob = transport.open_blob(repository, digest, token, existing).await?;
        let (mut hasher, mut written, mut file) = if blob.resumed {
            debug!(digest = %digest, offset = existing, "Resuming blob download");
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await
                .map_err(|e| PullError::io(partial, e))?;
            (hash_prefix(partial.to_path_buf()).await?, existing, file)
        } else {
            let file = tokio::fs::File::create(partial)
                .await
                .map_err(|e| PullError::io(partial, e))?;
            (Sha256::new(), 0u64, file)
        };

        let mut stream = blob.stream;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(PullError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| PullError::io(partial, e))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(|e| PullError::io(partial, e))?;
        drop(file);

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest {
            let _ = tokio::fs::remove_file(partial).await;
            return Err(PullError::layer(digest, format!("digest mismatch, got {}", actual)));
        }
        Ok(written)
    }

    async fn publish(&self, digest: &str, partial: &Path, info: &BlobInfo) -> PullResult<()> {
        let blob = self.blob_path(digest)?;
        let sidecar = self.sidecar_path(digest)?;
        if let Some(parent) = blob.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PullError::io(parent, e))?;
        }
        tokio::fs::rename(partial, &blob)
            .await
            .map_err(|e| PullError::io(&blob, e))?;

        let json = serde_json::to_vec(info).map_err(|e| PullError::FileCreationFailed {
            path: sidecar.clone(),
            reason: e.to_string(),
        })?;
        let tmp = sidecar.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| PullError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &sidecar)
            .await
            .map_err(|e| PullError::io(&sidecar, e))
    }

    /// Open a cached blob as its decompressed byte stream.
    pub fn open_decompressed(&self, digest: &str, kind: BlobKind) -> PullResult<Box<dyn Read + Send>> {
        let path = self.blob_path(digest)?;
        let file = File::open(&path).map_err(|e| PullError::io(&path, e))?;
        let reader = BufReader::new(file);
        Ok(match kind {
            BlobKind::Gzip => Box::new(MultiGzDecoder::new(reader)),
            BlobKind::Raw => Box::new(reader),
        })
    }

    /// Remove every blob whose digest is not in `referenced`, plus all
    /// temporary downloads.
    pub async fn prune(&self, referenced: &HashSet<String>) -> PullResult<CachePruneReport> {
        let mut report = CachePruneReport::default();

        let blobs_dir = self.root.join(BLOBS_DIR);
        let keep: HashSet<&str> = referenced
            .iter()
            .filter_map(|d| digest_hex(d).ok())
            .collect();
        for (path, len) in list_files(&blobs_dir).await? {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let hex = file_name.split('.').next().unwrap_or(file_name);
            if keep.contains(hex) {
                continue;
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| PullError::io(&path, e))?;
            if !file_name.contains('.') {
                report.removed_blobs += 1;
            }
            report.reclaimed_bytes += len;
        }

        for (path, len) in list_files(&self.root.join(TMP_DIR)).await? {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| PullError::io(&path, e))?;
            report.removed_temp_files += 1;
            report.reclaimed_bytes += len;
        }

        info!(
            blobs = report.removed_blobs,
            temp = report.removed_temp_files,
            bytes = report.reclaimed_bytes,
            "Pruned content cache"
        );
        Ok(report)
    }

    /// Digests of every complete cache entry.
    pub async fn cached_digests(&self) -> PullResult<HashSet<String>> {
        let mut digests = HashSet::new();
        for (path, _) in list_files(&self.root.join(BLOBS_DIR)).await? {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(hex) = name.strip_suffix(".json") {
                    digests.insert(format!("sha256:{}", hex));
                }
            }
        }
        Ok(digests)
    }
}

/// The hex part of a `sha256:<hex>` digest, validated so it is safe as a file name.
pub fn digest_hex(digest: &str) -> PullResult<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| PullError::layer(digest, "unsupported digest format"))?;
    Ok(hex)
}

async fn list_files(dir: &Path) -> PullResult<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(PullError::io(dir, e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| PullError::io(dir, e))? {
        let meta = entry.metadata().await.map_err(|e| PullError::io(entry.path(), e))?;
        if meta.is_file() {
            files.push((entry.path(), meta.len()));
        }
    }
    Ok(files)
}

async fn hash_prefix(path: PathBuf) -> PullResult<Sha256> {
    let for_err = path.clone();
    tokio::task::spawn_blocking(move || -> io::Result<Sha256> {
        let mut hasher = Sha256::new();
        let mut file = File::open(&path)?;
        io::copy(&mut file, &mut hasher)?;
        Ok(hasher)
    })
    .await
    .map_err(|e| PullError::io(&for_err, io::Error::new(io::ErrorKind::Other, e)))?
    .map_err(|e| PullError::io(&for_err, e))
}

/// Decompress `path` once, discarding output, and return the decompressed length.
async fn validate_gzip(path: PathBuf, cancel: CancelToken) -> PullResult<u64> {
    let for_err = path.clone();
    let result = tokio::task::spawn_blocking(move || -> PullResult<u64> {
        let file = File::open(&path).map_err(|e| PullError::io(&path, e))?;
        let mut decoder = MultiGzDecoder::new(BufReader::new(file));
        let mut buf = vec![0u8; 256 * 1024];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(PullError::Cancelled);
            }
            match decoder.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(PullError::DecompressionFailed {
                        file: path.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(join) => Err(PullError::DecompressionFailed {
            file: for_err,
            reason: join.to_string(),
        }),
    }
}
