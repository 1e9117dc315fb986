// Local image index
//
//   <cache>/images/<name>/<tag>/image.json   ImageRecord
//                              /disk.img     reassembled disk
//                              /nvram.bin    when the image ships one
//                              /config.json  VM config layer, when present
//
// An image is listed only once `image.json` exists, which is written last.
// Pulls build a new version under `<cache>/staging/` and swap it in by
// rename, so a failed re-pull leaves the previous version untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::error::{PullError, PullResult};
use crate::registry::reference::ImageReference;

const IMAGES_DIR: &str = "images";
const STAGING_DIR: &str = "staging";
const RECORD_FILE: &str = "image.json";
pub const IMAGE_DISK_FILE: &str = "disk.img";
pub const IMAGE_NVRAM_FILE: &str = "nvram.bin";
pub const IMAGE_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub reference: ImageReference,
    pub manifest_digest: String,
    /// Digests of every blob this image was built from.
    pub digests: Vec<String>,
    pub uncompressed_size: u64,
    pub has_nvram: bool,
    pub has_config: bool,
    pub pulled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImageIndex {
    root: PathBuf,
    staging: PathBuf,
}

impl ImageIndex {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            root: cache_root.join(IMAGES_DIR),
            staging: cache_root.join(STAGING_DIR),
        }
    }

    /// A fresh directory path to build one image version in.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging.join(uuid::Uuid::new_v4().to_string())
    }

    pub fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        self.root.join(&reference.name).join(&reference.tag)
    }

    pub fn disk_path(&self, reference: &ImageReference) -> PathBuf {
        self.image_dir(reference).join(IMAGE_DISK_FILE)
    }

    pub fn nvram_path(&self, reference: &ImageReference) -> PathBuf {
        self.image_dir(reference).join(IMAGE_NVRAM_FILE)
    }

    pub fn config_path(&self, reference: &ImageReference) -> PathBuf {
        self.image_dir(reference).join(IMAGE_CONFIG_FILE)
    }

    pub async fn get(&self, reference: &ImageReference) -> PullResult<Option<ImageRecord>> {
        read_record(&self.image_dir(reference).join(RECORD_FILE)).await
    }

    /// The record, if its disk is present at the recorded size.
    pub async fn get_complete(&self, reference: &ImageReference) -> PullResult<Option<ImageRecord>> {
        let Some(record) = self.get(reference).await? else {
            return Ok(None);
        };
        match tokio::fs::metadata(self.disk_path(reference)).await {
            Ok(meta) if meta.len() == record.uncompressed_size => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    pub async fn save(&self, record: &ImageRecord) -> PullResult<()> {
        write_record(&self.image_dir(&record.reference), record).await
    }

    /// Record `record` in the staged directory and move it into place,
    /// replacing any previous version of the same reference.
    pub async fn install(&self, record: &ImageRecord, staged: &Path) -> PullResult<()> {
        write_record(staged, record).await?;

        let dir = self.image_dir(&record.reference);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PullError::io(parent, e))?;
        }
        let previous = self.staging_dir();
        let replaced = match tokio::fs::rename(&dir, &previous).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(PullError::io(&dir, e)),
        };
        if let Err(e) = tokio::fs::rename(staged, &dir).await {
            if replaced {
                let _ = tokio::fs::rename(&previous, &dir).await;
            }
            return Err(PullError::io(&dir, e));
        }
        if replaced {
            if let Err(e) = tokio::fs::remove_dir_all(&previous).await {
                tracing::warn!(path = %previous.display(), error = %e, "Failed to remove replaced image");
            }
        }
        Ok(())
    }

    /// Drop a staged directory after a failed pull.
    pub async fn discard(&self, staged: &Path) {
        match tokio::fs::remove_dir_all(staged).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %staged.display(), error = %e, "Failed to remove staged image"),
        }
    }

    pub async fn list(&self) -> PullResult<Vec<ImageRecord>> {
        let mut records = Vec::new();
        for name_dir in subdirectories(&self.root).await? {
            for tag_dir in subdirectories(&name_dir).await? {
                if let Some(record) = read_record(&tag_dir.join(RECORD_FILE)).await? {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.reference.to_string().cmp(&b.reference.to_string()));
        Ok(records)
    }

    /// Remove one image's directory. Returns whether it existed.
    pub async fn remove(&self, reference: &ImageReference) -> PullResult<bool> {
        let dir = self.image_dir(reference);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PullError::io(&dir, e)),
        }
    }

    /// Remove every image, complete or not. Returns how many were listed.
    pub async fn clear(&self) -> PullResult<usize> {
        let count = self.list().await?.len();
        self.clear_staging().await?;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(PullError::io(&self.root, e)),
        }
    }

    /// Remove image directories that never got a record and versions left
    /// staged by interrupted pulls.
    pub async fn remove_incomplete(&self) -> PullResult<usize> {
        let mut removed = self.clear_staging().await?;
        for name_dir in subdirectories(&self.root).await? {
            for tag_dir in subdirectories(&name_dir).await? {
                if !tag_dir.join(RECORD_FILE).exists() {
                    tokio::fs::remove_dir_all(&tag_dir)
                        .await
                        .map_err(|e| PullError::io(&tag_dir, e))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn clear_staging(&self) -> PullResult<usize> {
        let staged = subdirectories(&self.staging).await?;
        for dir in &staged {
            tokio::fs::remove_dir_all(dir)
                .await
                .map_err(|e| PullError::io(dir, e))?;
        }
        Ok(staged.len())
    }

    /// Every digest referenced by any indexed image.
    pub async fn referenced_digests(&self) -> PullResult<HashSet<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .flat_map(|r| r.digests)
            .collect())
    }
}

async fn write_record(dir: &Path, record: &ImageRecord) -> PullResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PullError::io(dir, e))?;
    let path = dir.join(RECORD_FILE);
    let json = serde_json::to_vec_pretty(record).map_err(|e| PullError::FileCreationFailed {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let tmp = dir.join(format!(".{}.tmp-{}", RECORD_FILE, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| PullError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| PullError::io(&path, e))
}

async fn read_record(path: &Path) -> PullResult<Option<ImageRecord>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PullError::io(path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable image record");
            Ok(None)
        }
    }
}

async fn subdirectories(dir: &Path) -> PullResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(PullError::io(dir, e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| PullError::io(dir, e))? {
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(reference: &str, digests: &[&str], size: u64) -> ImageRecord {
        ImageRecord {
            reference: ImageReference::parse(reference).unwrap(),
            manifest_digest: "sha256:m".to_string(),
            digests: digests.iter().map(|d| d.to_string()).collect(),
            uncompressed_size: size,
            has_nvram: false,
            has_config: false,
            pulled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_get_list() {
        let tmp = TempDir::new().unwrap();
        let index = ImageIndex::new(tmp.path());
        let a = record("alpha:1", &["sha256:a"], 4);
        let b = record("beta", &["sha256:b", "sha256:a"], 4);
        index.save(&b).await.unwrap();
        index.save(&a).await.unwrap();

        assert_eq!(index.get(&a.reference).await.unwrap(), Some(a.clone()));
        let listed: Vec<_> = index.list().await.unwrap().into_iter().map(|r| r.reference.to_string()).collect();
        assert_eq!(listed, vec!["alpha:1", "beta:latest"]);
        assert_eq!(
            index.referenced_digests().await.unwrap(),
            HashSet::from(["sha256:a".to_string(), "sha256:b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_get_complete_checks_disk_size() {
        let tmp = TempDir::new().unwrap();
        let index = ImageIndex::new(tmp.path());
        let r = record("alpha", &[], 4);
        index.save(&r).await.unwrap();
        assert_eq!(index.get_complete(&r.reference).await.unwrap(), None);

        std::fs::write(index.disk_path(&r.reference), b"1234").unwrap();
        assert!(index.get_complete(&r.reference).await.unwrap().is_some());

        std::fs::write(index.disk_path(&r.reference), b"12").unwrap();
        assert_eq!(index.get_complete(&r.reference).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_replaces_previous_version() {
        let tmp = TempDir::new().unwrap();
        let index = ImageIndex::new(tmp.path());
        let old = record("alpha", &["sha256:old"], 3);
        index.save(&old).await.unwrap();
        std::fs::write(index.disk_path(&old.reference), b"old").unwrap();

        let staged = index.staging_dir();
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join(IMAGE_DISK_FILE), b"new!").unwrap();
        let new = record("alpha", &["sha256:new"], 4);
        index.install(&new, &staged).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(index.disk_path(&new.reference)).unwrap(), b"new!");
        assert_eq!(index.get_complete(&new.reference).await.unwrap(), Some(new));
        assert!(std::fs::read_dir(tmp.path().join(STAGING_DIR)).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_staging_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let index = ImageIndex::new(tmp.path());
        let staged = index.staging_dir();
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join(IMAGE_DISK_FILE), b"partial").unwrap();

        assert!(index.list().await.unwrap().is_empty());
        assert_eq!(index.remove_incomplete().await.unwrap(), 1);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let tmp = TempDir::new().unwrap();
        let index = ImageIndex::new(tmp.path());
        let a = record("alpha", &[], 0);
        index.save(&a).await.unwrap();
        index.save(&record("beta", &[], 0)).await.unwrap();
        std::fs::create_dir_all(index.image_dir(&ImageReference::parse("gamma").unwrap())).unwrap();

        assert_eq!(index.remove_incomplete().await.unwrap(), 1);
        assert!(index.remove(&a.reference).await.unwrap());
        assert!(!index.remove(&a.reference).await.unwrap());
        assert_eq!(index.clear().await.unwrap(), 1);
        assert!(index.list().await.unwrap().is_empty());
    }
}
