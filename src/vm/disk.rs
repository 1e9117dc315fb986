// Disk Allocator
//
// Disk images are sparse files: sizing only moves the end of file, and copies
// skip all-zero blocks so unwritten regions never take physical storage.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::vm::error::{VmError, VmResult};

/// Granularity for detecting holes while copying.
pub const SPARSE_BLOCK: usize = 64 * 1024;

/// Create the disk file if absent, then truncate or extend it to exactly `bytes`.
pub async fn set_size(path: &Path, bytes: u64) -> VmResult<()> {
    let path = path.to_path_buf();
    run_blocking(path.clone(), move || {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.set_len(bytes)?;
        file.sync_all()
    })
    .await
}

/// Like `set_size`, but refuses to make an existing disk smaller.
pub async fn grow_to(path: &Path, bytes: u64) -> VmResult<()> {
    let current = current_size(path).await?;
    if bytes < current {
        return Err(VmError::ResizeTooSmall {
            current,
            requested: bytes,
        });
    }
    if bytes == current {
        return Ok(());
    }
    tracing::debug!(path = %path.display(), from = current, to = bytes, "Growing disk");
    set_size(path, bytes).await
}

/// Logical size of the disk, zero when it does not exist yet.
pub async fn current_size(path: &Path) -> VmResult<u64> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(VmError::io(path, e)),
    }
}

/// Copy `src` to `dst` as a new, independent sparse file.
pub async fn copy_sparse(src: &Path, dst: &Path) -> VmResult<u64> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    let src_for_err = src.clone();
    let result = tokio::task::spawn_blocking(move || -> io::Result<u64> {
        let mut input = File::open(&src)?;
        let len = input.metadata()?.len();
        let mut output = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&dst)?;
        write_sparse(&mut input, &mut output)?;
        output.set_len(len)?;
        output.sync_all()?;
        Ok(len)
    })
    .await;

    match result {
        Ok(Ok(len)) => Ok(len),
        Ok(Err(e)) => Err(VmError::io(src_for_err, e)),
        Err(join) => Err(VmError::io(
            src_for_err,
            io::Error::new(io::ErrorKind::Other, join),
        )),
    }
}

/// Stream `reader` into `output` from its current position, seeking over
/// all-zero blocks instead of writing them. Returns bytes consumed.
///
/// The caller must `set_len` afterwards if the stream may end in a hole.
pub fn write_sparse<R: Read, W: Write + Seek>(reader: &mut R, output: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; SPARSE_BLOCK];
    let mut total = 0u64;

    loop {
        let filled = read_full(reader, &mut buf)?;
        if filled == 0 {
            break;
        }
        let block = &buf[..filled];
        if block.iter().all(|&b| b == 0) {
            output.seek(SeekFrom::Current(filled as i64))?;
        } else {
            output.write_all(block)?;
        }
        total += filled as u64;
        if filled < buf.len() {
            break;
        }
    }

    Ok(total)
}

/// Fill `buf` unless the reader hits EOF first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

async fn run_blocking<F>(path: PathBuf, f: F) -> VmResult<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(VmError::FileCreationFailed {
            path,
            reason: e.to_string(),
        }),
        Err(join) => Err(VmError::FileCreationFailed {
            path,
            reason: join.to_string(),
        }),
    }
}
