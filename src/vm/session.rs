// Remote-display session record, persisted as `<vm-dir>/sessions.json`.
//
// Present only while a display service runs for the VM.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vm::error::{VmError, VmResult};
use crate::vm::storage::{write_atomic, VmDirectory};

/// A host directory exported to the guest over virtio-fs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDirectory {
    pub host_path: PathBuf,
    pub tag: String,
    #[serde(default)]
    pub read_only: bool,
}

impl std::str::FromStr for SharedDirectory {
    type Err = VmError;

    /// Parses `PATH[:ro]` or `TAG=PATH[:ro]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (spec, read_only) = match s.strip_suffix(":ro") {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        let (tag, path) = match spec.split_once('=') {
            Some((tag, path)) => (tag.to_string(), PathBuf::from(path)),
            None => {
                let path = PathBuf::from(spec);
                let tag = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("share")
                    .to_string();
                (tag, path)
            }
        };
        if tag.is_empty() || path.as_os_str().is_empty() {
            return Err(VmError::InvalidConfigValue(format!(
                "invalid shared directory '{}', expected [TAG=]PATH[:ro]",
                s
            )));
        }
        Ok(Self {
            host_path: path,
            tag,
            read_only,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySession {
    pub url: String,
    #[serde(default)]
    pub shared_directories: Vec<SharedDirectory>,
    pub started_at: DateTime<Utc>,
}

impl DisplaySession {
    pub fn new(url: impl Into<String>, shared_directories: Vec<SharedDirectory>) -> Self {
        Self {
            url: url.into(),
            shared_directories,
            started_at: Utc::now(),
        }
    }

    pub async fn save(&self, dir: &VmDirectory) -> VmResult<()> {
        let path = dir.sessions_path();
        let json = serde_json::to_vec_pretty(self).map_err(|e| VmError::FileCreationFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json).await
    }

    /// `Ok(None)` when no session is recorded.
    pub async fn load(dir: &VmDirectory) -> VmResult<Option<Self>> {
        let path = dir.sessions_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VmError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VmError::InvalidConfigData {
                path,
                reason: e.to_string(),
            })
    }

    /// Remove the record. Clearing an absent session is not an error.
    pub async fn clear(dir: &VmDirectory) -> VmResult<()> {
        let path = dir.sessions_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VmError::io(&path, e)),
        }
    }
}
