// In-process sequential copy (spec §4.4).

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{Backend, TestOutcome};
use crate::error::Result;
use crate::fileio;
use crate::model::{FileState, Handle};
use crate::registry::SharedConfig;

pub struct SyncBackend {
    config: SharedConfig,
}

impl SyncBackend {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Copies every entry not yet `AtDestination`, in insertion order,
    /// best-effort: a failing entry is marked `Error` and the loop continues
    /// (spec §4.4 "on failure marks Error and continues"). Reads the chunk
    /// size and CRC policy from the live, shared config on every call, so a
    /// `config()` update made after this backend was constructed still
    /// takes effect on the next dispatch (spec §6).
    fn run(&self, handle: &mut Handle) -> TestOutcome {
        let (buf_size, verify_crc) = {
            let cfg = self.config.lock().unwrap();
            (cfg.file_buf_size as usize, cfg.verify_crc)
        };
        for entry in handle.files.values_mut() {
            if matches!(entry.state, FileState::AtDestination | FileState::Error) {
                continue;
            }
            entry.state = FileState::InProgress;

            let copied = (|| -> Result<()> {
                let mut src = fileio::open_read(&entry.source)?;
                let mut dst = fileio::open_write_create(&entry.destination)?;
                let mut offset = 0u64;
                loop {
                    let n = fileio::copy_chunk(&mut src, &mut dst, offset, buf_size)?;
                    if n == 0 {
                        break;
                    }
                    offset += n;
                    entry.bytes_transferred = offset;
                }
                if verify_crc {
                    entry.crc32 = Some(fileio::crc32_file(&entry.source, buf_size)?);
                }
                if let Some(meta) = &entry.metadata {
                    fileio::apply_metadata(&entry.destination, meta);
                }
                Ok(())
            })();

            match copied {
                Ok(()) => entry.state = FileState::AtDestination,
                Err(e) => {
                    debug!("sync copy of {:?} failed: {}", entry.source, e);
                    entry.mark_error(e.to_string());
                }
            }
        }

        if handle.any_file_errored() {
            TestOutcome::CompletedError
        } else if handle.all_files_at_destination() {
            TestOutcome::CompletedSuccess
        } else {
            TestOutcome::InProgress
        }
    }
}

#[async_trait]
impl Backend for SyncBackend {
    async fn start(&self, handle: &mut Handle) -> Result<()> {
        self.run(handle);
        Ok(())
    }

    async fn test(&self, handle: &mut Handle) -> Result<TestOutcome> {
        // Spec §4.4: "test and wait invoke start again on any non-terminal
        // handle"; already-AtDestination entries are skipped by `run`.
        Ok(self.run(handle))
    }

    async fn cancel(&self, handle: &mut Handle) -> Result<()> {
        for entry in handle.files.values_mut() {
            if entry.state == FileState::InProgress {
                entry.mark_error("cancelled");
            }
        }
        Ok(())
    }

    async fn resume(&self, handle: &mut Handle) -> Result<()> {
        for entry in handle.files.values_mut() {
            if entry.state != FileState::AtDestination {
                entry.state = FileState::AtSource;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::model::{FileEntry, HandleState, TransferKind};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn shared(config: GlobalConfig) -> SharedConfig {
        Arc::new(Mutex::new(config))
    }

    #[tokio::test]
    async fn copies_all_files_in_order() {
        let dir = tempdir().unwrap();
        let src_a = dir.path().join("a");
        let src_b = dir.path().join("b");
        std::fs::write(&src_a, b"alpha").unwrap();
        std::fs::write(&src_b, b"beta").unwrap();
        let dst_a = dir.path().join("out-a");
        let dst_b = dir.path().join("out-b");

        let mut handle = Handle::new(1, TransferKind::Sync, "t".into());
        handle.state = HandleState::Created;
        handle
            .files
            .insert(src_a.clone(), FileEntry::new(src_a.clone(), dst_a.clone()));
        handle
            .files
            .insert(src_b.clone(), FileEntry::new(src_b.clone(), dst_b.clone()));

        let backend = SyncBackend::new(shared(GlobalConfig::default()));
        backend.start(&mut handle).await.unwrap();

        assert_eq!(std::fs::read(&dst_a).unwrap(), b"alpha");
        assert_eq!(std::fs::read(&dst_b).unwrap(), b"beta");
        assert!(handle.all_files_at_destination());
    }

    #[tokio::test]
    async fn missing_source_is_isolated_error() {
        let dir = tempdir().unwrap();
        let src_ok = dir.path().join("ok");
        std::fs::write(&src_ok, b"fine").unwrap();
        let src_missing = dir.path().join("missing");
        let dst_ok = dir.path().join("out-ok");
        let dst_missing = dir.path().join("out-missing");

        let mut handle = Handle::new(2, TransferKind::Sync, "t".into());
        handle.files.insert(
            src_missing.clone(),
            FileEntry::new(src_missing.clone(), dst_missing),
        );
        handle
            .files
            .insert(src_ok.clone(), FileEntry::new(src_ok.clone(), dst_ok.clone()));

        let backend = SyncBackend::new(shared(GlobalConfig::default()));
        backend.start(&mut handle).await.unwrap();
        let outcome = backend.test(&mut handle).await.unwrap();
        assert_eq!(outcome, TestOutcome::CompletedError);

        assert_eq!(handle.files.get(&src_missing).unwrap().state, FileState::Error);
        assert_eq!(
            handle.files.get(&src_ok).unwrap().state,
            FileState::AtDestination
        );
        assert_eq!(std::fs::read(&dst_ok).unwrap(), b"fine");
    }
}
