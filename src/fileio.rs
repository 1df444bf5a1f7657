// Retrying file I/O, recursive mkdir, CRC32 and metadata capture/apply
// (spec §2 "FileIO", §7 "Transient I/O" / "Permanent I/O").
//
// Grounded on the teacher's `fsal/local/mod.rs` (metadata capture via
// `MetadataExt`, permission application via `PermissionsExt`) and on the
// original C implementation's `axl_io.c` (bounded open retry, `axl_getmode`).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;

use crc32fast::Hasher as Crc32Hasher;
use tracing::{debug, warn};

use crate::config::DEFAULT_OPEN_TRIES;
use crate::error::{AtlError, Result};
use crate::model::FileMetadata;

/// Sleep between retries of a transient I/O failure.
const RETRY_SLEEP: Duration = Duration::from_millis(100);

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}

/// Retries `f` up to `DEFAULT_OPEN_TRIES` times on transient errors, matching
/// `AXL_OPEN_TRIES` / `AXL_OPEN_USLEEP` in `axl_io.c`. Permanent errors
/// (ENOENT, EACCES, ...) propagate immediately.
fn retrying<T>(mut f: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < DEFAULT_OPEN_TRIES => {
                attempt += 1;
                std::thread::sleep(RETRY_SLEEP);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn open_read(path: &Path) -> Result<File> {
    retrying(|| File::open(path)).map_err(|e| AtlError::io(path.display().to_string(), e))
}

pub fn open_write_create(path: &Path) -> Result<File> {
    retrying(|| {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(default_mode())
            .open(path)
    })
    .map_err(|e| AtlError::io(path.display().to_string(), e))
}

/// Recursively creates `dir` and any missing parents, treating "already
/// exists" as success (spec §4.2 dispatch: "create parent directories of
/// destination idempotently").
pub fn mkdir_p(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(AtlError::io(dir.display().to_string(), e)),
    }
}

/// Mode applied to a freshly created destination when `copy_metadata` is
/// disabled: read+write for owner/group/other, no execute bit, further
/// masked by the process umask — `axl_getmode(1, 1, 0)` in the original.
pub fn default_mode() -> u32 {
    let mode = 0o666;
    // umask(2) has no "peek" mode: set then immediately restore, as
    // axl_io.c's axl_getmode does.
    let mask = unsafe {
        let prev = libc::umask(0o022);
        libc::umask(prev);
        prev
    };
    mode & !mask
}

/// Copies up to `buf_size` bytes from `source[offset..]` into
/// `destination[offset..]`, returning the number of bytes copied (0 at EOF).
/// Callers loop this to stream an entire file (spec §4.4 "fixed-size
/// chunks").
pub fn copy_chunk(
    source: &mut File,
    destination: &mut File,
    offset: u64,
    buf_size: usize,
) -> Result<u64> {
    source
        .seek(SeekFrom::Start(offset))
        .map_err(|e| AtlError::io("source", e))?;
    destination
        .seek(SeekFrom::Start(offset))
        .map_err(|e| AtlError::io("destination", e))?;

    let mut buf = vec![0u8; buf_size];
    let n = retrying(|| source.read(&mut buf)).map_err(|e| AtlError::io("source", e))?;
    if n == 0 {
        return Ok(0);
    }
    retrying(|| destination.write_all(&buf[..n]).map(|_| n))
        .map_err(|e| AtlError::io("destination", e))?;
    Ok(n as u64)
}

/// Computes the CRC32 of an entire file, used when dispatch policy requires
/// integrity checking (spec §4.2, §3 invariant note on `optional_crc32`).
pub fn crc32_file(path: &Path, buf_size: usize) -> Result<u32> {
    let mut file = open_read(path)?;
    let mut hasher = Crc32Hasher::new();
    let mut buf = vec![0u8; buf_size];
    loop {
        let n = retrying(|| file.read(&mut buf)).map_err(|e| AtlError::io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Captures mode, ownership and timestamps from `path` (spec §6 persisted
/// `META` record).
pub fn capture_metadata(path: &Path) -> Result<FileMetadata> {
    let metadata = fs::metadata(path).map_err(|e| AtlError::io(path.display().to_string(), e))?;
    Ok(FileMetadata {
        mode: metadata.permissions().mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        atime_secs: metadata.atime(),
        atime_nsecs: metadata.atime_nsec() as u32,
        mtime_secs: metadata.mtime(),
        mtime_nsecs: metadata.mtime_nsec() as u32,
        ctime_secs: metadata.ctime(),
        ctime_nsecs: metadata.ctime_nsec() as u32,
    })
}

/// Reapplies captured metadata to a destination. Never fails the transfer on
/// a partial apply (DESIGN NOTES §9): logs a warning and keeps going.
pub fn apply_metadata(path: &Path, metadata: &FileMetadata) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(metadata.mode)) {
        warn!("failed to apply mode to {:?}: {}", path, e);
    }
    // Changing ownership requires privilege the calling process may not
    // have; failures here are warnings, not transfer errors.
    if unsafe { libc::chown(c_path(path).as_ptr(), metadata.uid, metadata.gid) } != 0 {
        debug!(
            "could not chown {:?} to {}:{}",
            path, metadata.uid, metadata.gid
        );
    }
    let atime = filetime::FileTime::from_unix_time(metadata.atime_secs, metadata.atime_nsecs as i64);
    let mtime = filetime::FileTime::from_unix_time(metadata.mtime_secs, metadata.mtime_nsecs as i64);
    if let Err(e) = filetime::set_file_times(path, atime, mtime) {
        warn!("failed to apply timestamps to {:?}: {}", path, e);
    }
}

fn c_path(path: &Path) -> std::ffi::CString {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes()).expect("path contains a NUL byte")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mkdir_p_is_idempotent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        mkdir_p(&nested).unwrap();
        mkdir_p(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn copy_chunk_streams_whole_file() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        std::fs::write(&src_path, b"hello world").unwrap();

        let mut src = open_read(&src_path).unwrap();
        let mut dst = open_write_create(&dst_path).unwrap();

        let mut offset = 0u64;
        loop {
            let n = copy_chunk(&mut src, &mut dst, offset, 4).unwrap();
            if n == 0 {
                break;
            }
            offset += n;
        }
        dst.flush().unwrap();
        assert_eq!(std::fs::read(&dst_path).unwrap(), b"hello world");
    }

    #[test]
    fn crc32_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"the quick brown fox").unwrap();
        let a = crc32_file(&path, 5).unwrap();
        let b = crc32_file(&path, 1024).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        std::fs::write(&src_path, b"x").unwrap();
        std::fs::write(&dst_path, b"x").unwrap();

        std::fs::set_permissions(&src_path, std::fs::Permissions::from_mode(0o640)).unwrap();
        let meta = capture_metadata(&src_path).unwrap();
        apply_metadata(&dst_path, &meta);

        let applied = fs::metadata(&dst_path).unwrap();
        assert_eq!(applied.permissions().mode() & 0o777, 0o640);
    }
}
