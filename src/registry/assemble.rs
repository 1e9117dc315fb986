// Reassembly: decompress cached parts 1..N in order straight into the
// destination disk at their offsets.
//
// The output is written as `<dest>.partial` and renamed over `<dest>` only
// after its length matches the uncompressed-size annotation, so a file at
// `<dest>` is always complete.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::registry::cache::{BlobInfo, BlobKind, ContentCache};
use crate::registry::error::{PullError, PullResult};
use crate::registry::manifest::ImageLayout;
use crate::vm::disk::write_sparse;

/// One part ready for reassembly.
#[derive(Debug, Clone)]
pub struct AssemblyPart {
    pub number: u32,
    pub digest: String,
    pub info: BlobInfo,
}

/// Match the layout's parts 1..N against what the cache holds.
///
/// Fails with `MissingPart(n)` for the first part that is absent from the
/// manifest or the cache.
pub async fn collect_parts(cache: &ContentCache, layout: &ImageLayout) -> PullResult<Vec<AssemblyPart>> {
    let mut parts = Vec::with_capacity(layout.parts.len());
    for number in 1..=layout.total_parts {
        let part = layout.parts.get(&number).ok_or(PullError::MissingPart(number))?;
        let info = cache
            .lookup(&part.digest)
            .await?
            .ok_or(PullError::MissingPart(number))?;
        parts.push(AssemblyPart {
            number,
            digest: part.digest.clone(),
            info,
        });
    }
    Ok(parts)
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Reassemble `layout` from `cache` into `dest`. Returns the final length.
pub async fn reassemble(
    cache: Arc<ContentCache>,
    layout: &ImageLayout,
    dest: &Path,
    expected_size: u64,
    cancel: &CancelToken,
) -> PullResult<u64> {
    let parts = collect_parts(&cache, layout).await?;

    let declared: u64 = parts.iter().map(|p| p.info.uncompressed_size).sum();
    if declared != expected_size {
        return Err(PullError::ReassemblyFailed(format!(
            "parts decompress to {} bytes but the image declares {}",
            declared, expected_size
        )));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PullError::ReassemblySetupFailed {
                path: parent.to_path_buf(),
                cause: e.to_string(),
            })?;
    }

    let partial = partial_path(dest);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&partial)
        .map_err(|e| PullError::FileCreationFailed {
            path: partial.clone(),
            reason: e.to_string(),
        })?;

    let worker_partial = partial.clone();
    let worker_cancel = cancel.clone();
    let written = tokio::task::spawn_blocking(move || {
        write_parts(&cache, parts, file, &worker_partial, expected_size, &worker_cancel)
    })
    .await
    .map_err(|e| PullError::ReassemblyFailed(e.to_string()))
    .and_then(|inner| inner);

    let written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };

    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|e| PullError::io(dest, e))?;
    info!(dest = %dest.display(), bytes = written, "Reassembled disk image");
    Ok(written)
}

fn write_parts(
    cache: &ContentCache,
    parts: Vec<AssemblyPart>,
    mut file: File,
    partial: &Path,
    expected_size: u64,
    cancel: &CancelToken,
) -> PullResult<u64> {
    let mut offset = 0u64;
    for part in parts {
        if cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        let blob = cache.blob_path(&part.digest)?;
        let mut reader = Cancellable {
            inner: cache.open_decompressed(&part.digest, BlobKind::Gzip)?,
            cancel,
        };
        let n = match write_sparse(&mut reader, &mut file) {
            Ok(n) => n,
            Err(e) if cancel.is_cancelled() => {
                debug!(error = %e, "Reassembly interrupted");
                return Err(PullError::Cancelled);
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(PullError::DecompressionFailed {
                    file: blob,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(PullError::io(partial, e)),
        };
        if n != part.info.uncompressed_size {
            return Err(PullError::ReassemblyFailed(format!(
                "part {} decompressed to {} bytes, expected {}",
                part.number, n, part.info.uncompressed_size
            )));
        }
        offset += n;
        debug!(part = part.number, offset, "Wrote part");
    }

    // trailing zero blocks were skipped, so extend to the real end
    file.set_len(offset).map_err(|e| PullError::io(partial, e))?;
    file.sync_all().map_err(|e| PullError::io(partial, e))?;

    let actual = file.metadata().map_err(|e| PullError::io(partial, e))?.len();
    if actual != expected_size {
        return Err(PullError::ReassemblyFailed(format!(
            "assembled {} bytes, expected {}",
            actual, expected_size
        )));
    }
    Ok(actual)
}

struct Cancellable<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<R: Read> Read for Cancellable<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::{MockRegistry, PublishOptions};
    use tempfile::TempDir;

    async fn cached_image(tmp: &TempDir, disk: &[u8], part_size: usize) -> (Arc<ContentCache>, ImageLayout) {
        let registry = MockRegistry::new();
        let published = registry.publish_image("org/img", "latest", disk, part_size, PublishOptions::default());
        let cache = Arc::new(ContentCache::new(tmp.path().join("cache"), 2));
        let layout = ImageLayout::from_manifest(&published.manifest).unwrap();
        for part in layout.ordered_parts() {
            cache
                .fetch(&registry, "org/img", "t", &part.digest, BlobKind::Gzip, &CancelToken::new())
                .await
                .unwrap();
        }
        (cache, layout)
    }

    fn sample_disk() -> Vec<u8> {
        let mut disk = vec![0u8; 300_000];
        for (i, b) in disk.iter_mut().enumerate().take(70_000) {
            *b = (i % 251) as u8;
        }
        disk[250_000] = 0xee;
        disk
    }

    #[tokio::test]
    async fn test_reassemble_exact_bytes() {
        let tmp = TempDir::new().unwrap();
        let disk = sample_disk();
        let (cache, layout) = cached_image(&tmp, &disk, 64 * 1024).await;
        let dest = tmp.path().join("img").join("disk.img");

        let n = reassemble(cache, &layout, &dest, disk.len() as u64, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(n, disk.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), disk);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_trailing_zeros_still_reach_full_length() {
        let tmp = TempDir::new().unwrap();
        let mut disk = vec![0u8; 200_000];
        disk[0] = 1;
        let (cache, layout) = cached_image(&tmp, &disk, 50_000).await;
        let dest = tmp.path().join("disk.img");

        reassemble(cache, &layout, &dest, disk.len() as u64, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 200_000);
    }

    #[tokio::test]
    async fn test_huge_part_total_fails_without_allocating() {
        let tmp = TempDir::new().unwrap();
        let (cache, mut layout) = cached_image(&tmp, &sample_disk(), 64 * 1024).await;
        let present = layout.parts.len() as u32;
        layout.total_parts = u32::MAX;

        let err = collect_parts(&cache, &layout).await.unwrap_err();
        assert!(matches!(err, PullError::MissingPart(n) if n == present + 1), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_part_leaves_no_disk() {
        let tmp = TempDir::new().unwrap();
        let disk = sample_disk();
        let (cache, mut layout) = cached_image(&tmp, &disk, 64 * 1024).await;
        layout.parts.remove(&3);
        let dest = tmp.path().join("disk.img");

        let err = reassemble(cache, &layout, &dest, disk.len() as u64, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::MissingPart(3)));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_part_evicted_from_cache_is_missing() {
        let tmp = TempDir::new().unwrap();
        let disk = sample_disk();
        let (cache, layout) = cached_image(&tmp, &disk, 64 * 1024).await;
        let victim = &layout.parts[&2].digest;
        std::fs::remove_file(cache.blob_path(victim).unwrap()).unwrap();

        let err = reassemble(cache, &layout, &tmp.path().join("d.img"), disk.len() as u64, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::MissingPart(2)));
    }

    #[tokio::test]
    async fn test_size_mismatch_fails() {
        let tmp = TempDir::new().unwrap();
        let disk = sample_disk();
        let (cache, layout) = cached_image(&tmp, &disk, 64 * 1024).await;
        let dest = tmp.path().join("disk.img");

        let err = reassemble(cache, &layout, &dest, disk.len() as u64 + 1, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::ReassemblyFailed(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_discards_partial() {
        let tmp = TempDir::new().unwrap();
        let disk = sample_disk();
        let (cache, layout) = cached_image(&tmp, &disk, 64 * 1024).await;
        let dest = tmp.path().join("disk.img");
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = reassemble(cache, &layout, &dest, disk.len() as u64, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::Cancelled));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
