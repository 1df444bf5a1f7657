// Uniform shim over an external vendor transfer engine (spec §4.7).
//
// The real AXL binds this against BBAPI / DataWarp / NNFDM (see
// `examples/original_source/src/axl_async_{bbapi,datawarp,nnfdm}.c`); none of
// those wire protocols are in scope here (spec §1 Non-goals). What's
// specified and implemented is the abstract contract: `create_def → add_file
// → start → get_info → cancel → delete`, against a trait object so a real
// vendor crate can be substituted without touching `HandleRegistry`.

use async_trait::async_trait;

use crate::backend::{Backend, TestOutcome};
use crate::error::{AtlError, Result};
use crate::model::{BackendCookie, FileState, Handle};

/// States the external engine itself reports, prior to the spec §4.7 mapping
/// table collapsing them onto `TestOutcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Pending,
    Starting,
    Running,
    CompletedSuccess,
    CompletedFailure,
    NotFound,
}

impl EngineState {
    fn to_outcome(self) -> TestOutcome {
        match self {
            EngineState::Pending | EngineState::Starting | EngineState::Running => {
                TestOutcome::InProgress
            }
            EngineState::CompletedSuccess => TestOutcome::CompletedSuccess,
            EngineState::CompletedFailure | EngineState::NotFound => TestOutcome::CompletedError,
        }
    }
}

/// The minimal surface a vendor transfer engine must provide.
#[async_trait]
pub trait VendorEngine: Send + Sync {
    async fn create_def(&self) -> Result<String>;
    async fn add_file(&self, session: &str, source: &str, destination: &str) -> Result<String>;
    async fn start(&self, session: &str) -> Result<()>;
    async fn get_info(&self, file_cookie: &str) -> Result<EngineState>;
    async fn cancel(&self, file_cookie: &str) -> Result<()>;
    async fn delete(&self, session: &str) -> Result<()>;
}

/// In-crate mock engine used for tests and as a template for a real vendor
/// binding: every file "completes" the moment `get_info` is first polled,
/// having performed the copy itself via `fileio`.
pub struct MockVendorEngine;

#[async_trait]
impl VendorEngine for MockVendorEngine {
    async fn create_def(&self) -> Result<String> {
        Ok(format!("session-{}", crate::model::now_unix().0))
    }

    async fn add_file(&self, _session: &str, source: &str, destination: &str) -> Result<String> {
        let src = std::path::PathBuf::from(source);
        let dst = std::path::PathBuf::from(destination);
        let buf_size = crate::config::DEFAULT_FILE_BUF_SIZE as usize;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut s = crate::fileio::open_read(&src)?;
            let mut d = crate::fileio::open_write_create(&dst)?;
            let mut offset = 0u64;
            loop {
                let n = crate::fileio::copy_chunk(&mut s, &mut d, offset, buf_size)?;
                if n == 0 {
                    break;
                }
                offset += n;
            }
            Ok(())
        })
        .await
        .map_err(|e| AtlError::BackendFailure(e.to_string()))??;
        Ok(format!("file-{source}"))
    }

    async fn start(&self, _session: &str) -> Result<()> {
        Ok(())
    }

    async fn get_info(&self, _file_cookie: &str) -> Result<EngineState> {
        Ok(EngineState::CompletedSuccess)
    }

    async fn cancel(&self, _file_cookie: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _session: &str) -> Result<()> {
        Ok(())
    }
}

pub struct VendorBackend {
    engine: Box<dyn VendorEngine>,
    copy_metadata: bool,
}

impl VendorBackend {
    pub fn new(engine: Box<dyn VendorEngine>, copy_metadata: bool) -> Self {
        Self {
            engine,
            copy_metadata,
        }
    }
}

#[async_trait]
impl Backend for VendorBackend {
    async fn start(&self, handle: &mut Handle) -> Result<()> {
        let session = self.engine.create_def().await?;
        handle
            .backend_bag
            .insert("session".to_string(), session.clone());

        for entry in handle.files.values_mut() {
            let cookie = self
                .engine
                .add_file(
                    &session,
                    &entry.source.display().to_string(),
                    &entry.destination.display().to_string(),
                )
                .await?;
            entry.cookie = BackendCookie::VendorSession(cookie);
            entry.state = FileState::InProgress;
        }

        self.engine.start(&session).await
    }

    async fn test(&self, handle: &mut Handle) -> Result<TestOutcome> {
        let mut any_error = false;
        let mut all_done = true;

        for entry in handle.files.values_mut() {
            if entry.state == FileState::AtDestination || entry.state == FileState::Error {
                continue;
            }
            let BackendCookie::VendorSession(cookie) = &entry.cookie else {
                all_done = false;
                continue;
            };
            let engine_state = self.engine.get_info(cookie).await?;
            match engine_state.to_outcome() {
                TestOutcome::InProgress => all_done = false,
                TestOutcome::CompletedSuccess => {
                    entry.state = FileState::AtDestination;
                    if self.copy_metadata {
                        if let Some(meta) = &entry.metadata {
                            crate::fileio::apply_metadata(&entry.destination, meta);
                        }
                    }
                }
                TestOutcome::CompletedError => {
                    entry.mark_error("vendor engine reported failure");
                    any_error = true;
                }
            }
        }

        if any_error {
            Ok(TestOutcome::CompletedError)
        } else if all_done {
            Ok(TestOutcome::CompletedSuccess)
        } else {
            Ok(TestOutcome::InProgress)
        }
    }

    async fn cancel(&self, handle: &mut Handle) -> Result<()> {
        for entry in handle.files.values_mut() {
            if entry.state == FileState::InProgress {
                if let BackendCookie::VendorSession(cookie) = &entry.cookie {
                    // not-found is treated as success: the session may have
                    // completed concurrently (spec §4.7).
                    let _ = self.engine.cancel(cookie).await;
                }
                entry.state = FileState::Error;
                entry.error_message = Some("cancelled".to_string());
            }
        }
        if let Some(session) = handle.backend_bag.get("session").cloned() {
            let _ = self.engine.delete(&session).await;
        }
        Ok(())
    }

    async fn free(&self, handle: &mut Handle) -> Result<()> {
        if let Some(session) = handle.backend_bag.remove("session") {
            let _ = self.engine.delete(&session).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileEntry, TransferKind};
    use tempfile::tempdir;

    #[tokio::test]
    async fn mock_engine_completes_immediately() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("out-a");
        std::fs::write(&src, b"vendor payload").unwrap();

        let mut handle = Handle::new(1, TransferKind::VendorA, "t".into());
        handle
            .files
            .insert(src.clone(), FileEntry::new(src, dst.clone()));

        let backend = VendorBackend::new(Box::new(MockVendorEngine), false);
        backend.start(&mut handle).await.unwrap();
        let outcome = backend.test(&mut handle).await.unwrap();

        assert_eq!(outcome, TestOutcome::CompletedSuccess);
        assert_eq!(std::fs::read(&dst).unwrap(), b"vendor payload");
    }
}
