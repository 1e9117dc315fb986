// Per-VM mutual exclusion
//
// Two layers, taken in order:
// 1. an in-process async mutex keyed by the VM's lock path, so tasks in one
//    process queue up instead of spinning on the file lock;
// 2. an advisory exclusive lock on `<root>/.locks/<name>.lock`, so a CLI
//    invocation and a running server never mutate the same VM at once.
//
// Both are released when the guard drops.
//
// A separate run lease (`<root>/.locks/<name>.run`) is held exclusively by
// the process that started the VM, for as long as the VM runs. Other
// processes test it with a shared try-lock to learn that the VM is running
// somewhere else. The OS drops the lease if that process dies.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs4::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::vm::error::{VmError, VmResult};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the duration of one mutating operation on one VM.
#[derive(Debug)]
pub struct VmGuard {
    name: String,
    _file: File,
    _local: OwnedMutexGuard<()>,
}

impl VmGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        debug!(vm = %self.name, "Released VM lock");
    }
}

/// Held by the process running a VM until the VM stops.
#[derive(Debug)]
pub struct RunLease {
    _file: File,
}

pub struct VmLocks {
    local: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl VmLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            local: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn local_mutex(&self, lock_path: &Path) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // entries nobody holds or waits on are only referenced by the map
        map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        map.entry(lock_path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire both lock layers for `name`, failing with `Busy` after the timeout.
    pub async fn acquire(&self, name: &str, lock_path: &Path) -> VmResult<VmGuard> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let local = tokio::time::timeout_at(deadline, self.local_mutex(lock_path).lock_owned())
            .await
            .map_err(|_| VmError::Busy(name.to_string()))?;

        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VmError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| VmError::io(lock_path, e))?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(VmError::Busy(name.to_string()));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(VmError::io(lock_path, e)),
            }
        }

        debug!(vm = %name, lock = %lock_path.display(), "Acquired VM lock");
        Ok(VmGuard {
            name: name.to_string(),
            _file: file,
            _local: local,
        })
    }

    /// Take the run lease for a VM this process is about to start. Another
    /// process's `lease_held` check can hold it for a moment; a lease still
    /// held at the timeout belongs to a running VM.
    pub async fn acquire_lease(&self, name: &str, lease_path: &Path) -> VmResult<RunLease> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        if let Some(parent) = lease_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VmError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lease_path)
            .map_err(|e| VmError::io(lease_path, e))?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(VmError::AlreadyRunning(name.to_string()));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(VmError::io(lease_path, e)),
            }
        }
        debug!(vm = %name, lease = %lease_path.display(), "Acquired run lease");
        Ok(RunLease { _file: file })
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Whether the run lease at `lease_path` is held through any other file
/// handle, including one owned by this process.
pub fn lease_held(lease_path: &Path) -> VmResult<bool> {
    let file = match OpenOptions::new().read(true).open(lease_path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(VmError::io(lease_path, e)),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(true),
        Err(e) => Err(VmError::io(lease_path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_name_is_serialized() {
        let tmp = TempDir::new().unwrap();
        let locks = Arc::new(VmLocks::new(Duration::from_secs(5)));
        let path = tmp.path().join(".locks").join("vm1.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let path = path.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("vm1", &path).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let tmp = TempDir::new().unwrap();
        let locks = VmLocks::new(Duration::from_millis(200));
        let _a = locks
            .acquire("a", &tmp.path().join(".locks/a.lock"))
            .await
            .unwrap();
        let _b = locks
            .acquire("b", &tmp.path().join(".locks/b.lock"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_held_lock_times_out_busy() {
        let tmp = TempDir::new().unwrap();
        let locks = VmLocks::new(Duration::from_millis(150));
        let path = tmp.path().join(".locks/vm1.lock");
        let _held = locks.acquire("vm1", &path).await.unwrap();
        assert!(matches!(
            locks.acquire("vm1", &path).await,
            Err(VmError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_file_lock_held_elsewhere_is_busy() {
        // A second lock table models another process sharing the lock file.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".locks/vm1.lock");
        let first = VmLocks::new(Duration::from_millis(150));
        let second = VmLocks::new(Duration::from_millis(150));

        let guard = first.acquire("vm1", &path).await.unwrap();
        assert!(matches!(
            second.acquire("vm1", &path).await,
            Err(VmError::Busy(_))
        ));
        drop(guard);
        second.acquire("vm1", &path).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_mutexes_are_evicted() {
        let tmp = TempDir::new().unwrap();
        let locks = VmLocks::new(Duration::from_millis(200));
        for i in 0..20 {
            let path = tmp.path().join(format!(".locks/vm{}.lock", i));
            let _guard = locks.acquire("vm", &path).await.unwrap();
        }
        assert!(locks.tracked() <= 1);
    }

    #[tokio::test]
    async fn test_run_lease_visible_until_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".locks/vm1.run");
        assert!(!lease_held(&path).unwrap());

        let owner = VmLocks::new(Duration::from_millis(150));
        let lease = owner.acquire_lease("vm1", &path).await.unwrap();
        assert!(lease_held(&path).unwrap());

        let other = VmLocks::new(Duration::from_millis(150));
        assert!(matches!(
            other.acquire_lease("vm1", &path).await,
            Err(VmError::AlreadyRunning(_))
        ));

        drop(lease);
        assert!(!lease_held(&path).unwrap());
        other.acquire_lease("vm1", &path).await.unwrap();
    }
}
