// HandleRegistry: allocates handle IDs, holds per-handle state, enforces the
// state machine, and routes calls through the BackendDispatcher (spec §4.2).
//
// One struct owning a map keyed by an opaque ID plus a monotonic counter,
// with one method per public operation split across sibling files, each
// implementing a single operation against the shared handle map.

mod add;
mod cancel;
mod config;
mod create;
mod dispatch;
mod free;
mod init;
mod resume;
mod test;
mod wait;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::backend::BackendDispatcher;
use crate::config::GlobalConfig;
use crate::error::{AtlError, Result};
use crate::model::{ControlPaths, Handle, HandleId, HandleState};

/// Shared so a `config()` call or a config-file value applied in `init`
/// is visible to every backend at dispatch time, not just a snapshot
/// frozen when the backend was constructed (spec §6: `file_buf_size`,
/// `verify_crc` apply to Sync and WorkerPool for the lifetime of the
/// registry, not just at `HandleRegistry::new`).
pub(crate) type SharedConfig = Arc<Mutex<GlobalConfig>>;

pub struct HandleRegistry {
    handles: IndexMap<HandleId, Handle>,
    next_id: HandleId,
    control: ControlPaths,
    pub(crate) config: SharedConfig,
    dispatcher: BackendDispatcher,
    default_state_file_path: Option<PathBuf>,
    /// Handle IDs reloaded from a persisted state file at `init` and not yet
    /// `resume`d; `resume` is only legal for a member of this set (spec
    /// §4.2: "Legal only if id refers to a handle loaded from a persisted
    /// state file").
    resumable: HashSet<HandleId>,
    initialized: bool,
}

impl HandleRegistry {
    /// Constructs a registry bound to `control_dir`, with the standard four
    /// backends registered. Does not read configuration or load persisted
    /// state; call `init` for that.
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        let control = ControlPaths::new(control_dir);
        let config: SharedConfig = Arc::new(Mutex::new(GlobalConfig::default()));
        let dispatcher = crate::backend::build_default_dispatcher(&control, config.clone());
        Self {
            handles: IndexMap::new(),
            next_id: 1,
            control,
            config,
            dispatcher,
            default_state_file_path: None,
            resumable: HashSet::new(),
            initialized: false,
        }
    }

    pub fn control_paths(&self) -> &ControlPaths {
        &self.control
    }

    fn get(&self, id: HandleId) -> Result<&Handle> {
        self.handles.get(&id).ok_or(AtlError::UnknownHandle(id))
    }

    fn get_mut(&mut self, id: HandleId) -> Result<&mut Handle> {
        self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))
    }

    /// Persists the handle's tree to its bound (or registry-default) state
    /// file, if any is configured (spec §4.8). A handle bound to no state
    /// file at all is purely in-memory and is not persisted.
    fn persist(&self, id: HandleId) -> Result<()> {
        let handle = self.get(id)?;
        let path = handle
            .state_file_path
            .as_ref()
            .or(self.default_state_file_path.as_ref());
        let Some(path) = path else {
            return Ok(());
        };
        crate::state_persistence::snapshot_handle(path, handle)
    }

    pub fn handle_state(&self, id: HandleId) -> Result<HandleState> {
        Ok(self.get(id)?.state)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::error::AtlError;
    use crate::model::{HandleState, TransferKind};
    use crate::registry::HandleRegistry;

    #[tokio::test]
    async fn full_lifecycle_through_sync_backend() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.bin");
        std::fs::write(&src, b"checkpoint data").unwrap();
        let dst = dir.path().join("out.bin");

        let mut registry = HandleRegistry::new(dir.path());
        registry.init(None).await.unwrap();

        let id = registry
            .create(TransferKind::Sync, "job-42", None)
            .await
            .unwrap();
        assert_eq!(registry.handle_state(id).unwrap(), HandleState::Created);

        registry.add(id, &src, &dst).await.unwrap();
        registry.dispatch(id).await.unwrap();
        registry.wait(id).await.unwrap();

        assert_eq!(registry.handle_state(id).unwrap(), HandleState::Completed);
        assert_eq!(std::fs::read(&dst).unwrap(), b"checkpoint data");

        registry.free(id).await.unwrap();
        assert!(matches!(
            registry.handle_state(id),
            Err(AtlError::UnknownHandle(_))
        ));

        registry.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn add_rejects_duplicate_and_self_referential_paths() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.bin");
        std::fs::write(&src, b"x").unwrap();
        let dst = dir.path().join("out.bin");

        let mut registry = HandleRegistry::new(dir.path());
        let id = registry
            .create(TransferKind::Sync, "job", None)
            .await
            .unwrap();

        registry.add(id, &src, &src).await.unwrap_err();
        registry.add(id, &src, &dst).await.unwrap();
        assert!(matches!(
            registry.add(id, &src, &dst).await,
            Err(AtlError::DuplicateSource(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_handles() {
        let dir = tempdir().unwrap();
        let mut registry = HandleRegistry::new(dir.path());
        let id = registry
            .create(TransferKind::Sync, "job", None)
            .await
            .unwrap();

        registry.cancel(id).await.unwrap();
        assert_eq!(registry.handle_state(id).unwrap(), HandleState::Cancelled);
        registry.cancel(id).await.unwrap();
        assert_eq!(registry.handle_state(id).unwrap(), HandleState::Cancelled);
    }

    #[tokio::test]
    async fn double_init_without_finalize_is_an_error() {
        let dir = tempdir().unwrap();
        let mut registry = HandleRegistry::new(dir.path());
        registry.init(None).await.unwrap();
        assert!(matches!(
            registry.init(None).await,
            Err(AtlError::AlreadyInitialized)
        ));
        registry.finalize().await.unwrap();
        registry.init(None).await.unwrap();
    }

    #[tokio::test]
    async fn reload_from_persisted_state_requires_resume_before_test() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.bin");
        std::fs::write(&src, b"payload").unwrap();
        let dst = dir.path().join("out.bin");

        let id = {
            let mut registry = HandleRegistry::new(dir.path());
            registry.init(None).await.unwrap();
            let id = registry
                .create(TransferKind::Sync, "job", None)
                .await
                .unwrap();
            registry.add(id, &src, &dst).await.unwrap();
            registry.dispatch(id).await.unwrap();
            id
        };

        let mut registry = HandleRegistry::new(dir.path());
        registry.init(None).await.unwrap();
        assert_eq!(registry.handle_state(id).unwrap(), HandleState::Dispatched);

        assert!(matches!(
            registry.test(id).await,
            Err(AtlError::ResumeRequired(resume_id)) if resume_id == id
        ));

        registry.resume(id).await.unwrap();
        registry.wait(id).await.unwrap();
        assert_eq!(registry.handle_state(id).unwrap(), HandleState::Completed);
    }
}
