// VM Storage Layout
//
// Maps a VM name (optionally qualified by a storage location) to its directory:
//
//   <location-root>/<name>/config.json   serialized VmConfig
//                         /disk.img      primary block device
//                         /nvram.bin     EFI variable store
//                         /sessions.json remote display session (optional)
//
// Bookkeeping that must outlive a VM directory lives next to it:
//   <location-root>/.locks/<name>.lock   advisory inter-process lock
//   <location-root>/.staging-<uuid>/     directory being initialized

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::{expand_path, Settings};
use crate::vm::error::{VmError, VmResult};

pub const CONFIG_FILE: &str = "config.json";
pub const DISK_FILE: &str = "disk.img";
pub const NVRAM_FILE: &str = "nvram.bin";
pub const SESSIONS_FILE: &str = "sessions.json";

const LOCKS_DIR: &str = ".locks";
const STAGING_PREFIX: &str = ".staging-";

/// One VM's on-disk unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDirectory {
    name: String,
    location: String,
    path: PathBuf,
}

impl VmDirectory {
    pub fn new(name: impl Into<String>, location: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage location label this directory was resolved in.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.path.join(DISK_FILE)
    }

    pub fn nvram_path(&self) -> PathBuf {
        self.path.join(NVRAM_FILE)
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.path.join(SESSIONS_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// A directory is initialized iff config, disk and nvram all exist.
    pub fn initialized(&self) -> bool {
        self.config_path().is_file() && self.disk_path().is_file() && self.nvram_path().is_file()
    }

    /// Same directory, viewed at a different path (used while staging).
    pub(crate) fn at(&self, path: PathBuf) -> Self {
        Self {
            name: self.name.clone(),
            location: self.location.clone(),
            path,
        }
    }

    /// Logical and physically allocated size of the disk image in bytes.
    pub fn disk_usage(&self) -> VmResult<DiskUsage> {
        let disk = self.disk_path();
        let metadata = std::fs::metadata(&disk).map_err(|e| VmError::io(&disk, e))?;
        #[cfg(unix)]
        let allocated = {
            use std::os::unix::fs::MetadataExt;
            metadata.blocks() * 512
        };
        #[cfg(not(unix))]
        let allocated = metadata.len();
        Ok(DiskUsage {
            total: metadata.len(),
            allocated,
        })
    }

    /// Recursively remove the directory. Irreversible.
    pub async fn delete(&self) -> VmResult<()> {
        fs::remove_dir_all(&self.path)
            .await
            .map_err(|e| VmError::io(&self.path, e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub allocated: u64,
}

/// All configured storage locations.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    default: String,
    locations: BTreeMap<String, PathBuf>,
}

impl StorageLayout {
    pub fn new(default: impl Into<String>, locations: BTreeMap<String, PathBuf>) -> Self {
        Self {
            default: default.into(),
            locations,
        }
    }

    /// A layout with a single default location at `root`.
    pub fn single(root: impl Into<PathBuf>) -> Self {
        let mut locations = BTreeMap::new();
        locations.insert(crate::config::DEFAULT_LOCATION.to_string(), root.into());
        Self::new(crate::config::DEFAULT_LOCATION, locations)
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let locations = settings
            .storage
            .locations
            .iter()
            .map(|(name, path)| (name.clone(), expand_path(path)))
            .collect();
        Self::new(settings.storage.default.clone(), locations)
    }

    pub fn default_location(&self) -> &str {
        &self.default
    }

    pub fn locations(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.locations
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }

    /// Create the default location's root if it does not exist yet.
    pub async fn ensure_default_root(&self) -> VmResult<PathBuf> {
        let root = self
            .locations
            .get(&self.default)
            .cloned()
            .ok_or_else(|| VmError::UnknownLocation(self.default.clone()))?;
        fs::create_dir_all(&root)
            .await
            .map_err(|e| VmError::io(&root, e))?;
        Ok(root)
    }

    /// Resolve a location name or a literal path to its label and root directory.
    ///
    /// A location containing a path separator is taken as a directory path.
    pub fn location_root(&self, location: Option<&str>) -> VmResult<(String, PathBuf)> {
        let (label, root) = match location {
            None => {
                let root = self
                    .locations
                    .get(&self.default)
                    .ok_or_else(|| VmError::UnknownLocation(self.default.clone()))?;
                (self.default.clone(), root.clone())
            }
            Some(loc) if loc.contains('/') || loc.starts_with('~') => {
                (loc.to_string(), expand_path(loc))
            }
            Some(loc) => {
                let root = self
                    .locations
                    .get(loc)
                    .ok_or_else(|| VmError::UnknownLocation(loc.to_string()))?;
                (loc.to_string(), root.clone())
            }
        };

        let metadata = match std::fs::metadata(&root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VmError::LocationNotFound(root));
            }
            Err(e) => return Err(VmError::io(&root, e)),
        };
        if !metadata.is_dir() {
            return Err(VmError::NotADirectory(root));
        }
        if metadata.permissions().readonly() {
            return Err(VmError::NotWritable(root));
        }

        Ok((label, root))
    }

    /// Deterministic path computation for `name` in `location`.
    pub fn resolve(&self, name: &str, location: Option<&str>) -> VmResult<VmDirectory> {
        validate_name(name)?;
        let (label, root) = self.location_root(location)?;
        Ok(VmDirectory::new(name, label, root.join(name)))
    }

    /// Like `resolve`, but fails with `NotFound` when the directory is absent.
    pub fn existing(&self, name: &str, location: Option<&str>) -> VmResult<VmDirectory> {
        let dir = self.resolve(name, location)?;
        if !dir.exists() {
            return Err(VmError::NotFound(name.to_string()));
        }
        Ok(dir)
    }

    /// Every VM directory across all configured locations.
    ///
    /// Locations whose root is missing are skipped with a warning.
    pub async fn list(&self) -> VmResult<Vec<VmDirectory>> {
        let mut dirs = Vec::new();

        for (label, root) in &self.locations {
            let mut entries = match fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(location = %label, root = %root.display(), "Storage location missing, skipping");
                    continue;
                }
                Err(e) => return Err(VmError::io(root, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| VmError::io(root, e))?
            {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(VmDirectory::new(name, label.clone(), path));
                }
            }
        }

        dirs.sort_by(|a, b| a.name.cmp(&b.name).then(a.location.cmp(&b.location)));
        Ok(dirs)
    }

    /// A fresh hidden directory beside `dir` for building it before publishing.
    pub fn staging_path(&self, dir: &VmDirectory) -> PathBuf {
        let root = dir.path().parent().unwrap_or_else(|| Path::new("."));
        root.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn lock_path(&self, dir: &VmDirectory) -> PathBuf {
        let root = dir.path().parent().unwrap_or_else(|| Path::new("."));
        root.join(LOCKS_DIR).join(format!("{}.lock", dir.name()))
    }

    /// Run lease held while some process runs the VM.
    pub fn lease_path(&self, dir: &VmDirectory) -> PathBuf {
        let root = dir.path().parent().unwrap_or_else(|| Path::new("."));
        root.join(LOCKS_DIR).join(format!("{}.run", dir.name()))
    }
}

/// Names are single path components, not hidden, and printable.
pub fn validate_name(name: &str) -> VmResult<()> {
    let invalid = |reason: &str| {
        Err(VmError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > 255 {
        return invalid("name is longer than 255 bytes");
    }
    if name.starts_with('.') {
        return invalid("name must not start with '.'");
    }
    if name.contains('/') || name.contains('\\') {
        return invalid("name must not contain path separators");
    }
    if name.chars().any(|c| c.is_control()) {
        return invalid("name must not contain control characters");
    }
    Ok(())
}

/// Write `bytes` to `path` through a temp file and a rename, so readers see
/// either the previous contents or the new ones.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> VmResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(VmError::FileCreationFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }
    Ok(())
}
