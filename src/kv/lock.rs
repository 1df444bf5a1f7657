// Advisory file locking for the read-modify-write protocol shared between
// the library and the daemon copier (spec §4.1). `fs2` gives us a portable
// `flock`-style exclusive lock without shelling out.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::{AtlError, Result};

/// A held exclusive lock on the file at `path`. The lock is released when
/// this guard drops, matching "acquire exclusive lock on path ... release
/// lock" (spec §4.1).
pub struct LockedFile {
    file: File,
}

impl LockedFile {
    /// Opens (creating if necessary) and locks `path`. Blocks until the lock
    /// is acquired; other processes contending for the same transfer or
    /// state file serialize here.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| AtlError::io(path.display().to_string(), e))?;
        file.lock_exclusive()
            .map_err(|e| AtlError::io(path.display().to_string(), e))?;
        Ok(Self { file })
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
