// resume (spec §4.2; SPEC_FULL §3 daemon re-seed supplement).

use crate::error::{AtlError, Result};
use crate::model::{HandleId, HandleState};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Legal only if `id` refers to a handle reloaded from a persisted state
    /// file and currently in `Dispatched`. Re-binds backend resources: Sync
    /// and WorkerPool re-copy from `bytes_transferred`, Daemon re-merges the
    /// transfer file's `FILES` subtree and reissues `COMMAND=RUN`, Vendor
    /// backends do not support resume (the spec permits `resume` to be
    /// unsupported per backend; `resume` then fails with
    /// `ResumeUnsupported`).
    pub async fn resume(&mut self, id: HandleId) -> Result<()> {
        if !self.resumable.contains(&id) {
            return Err(AtlError::BackendFailure(format!(
                "handle {id} was not loaded from a persisted state file"
            )));
        }

        let state = self.handle_state(id)?;
        if state != HandleState::Dispatched {
            return Err(AtlError::state_machine(id, state, "Dispatched"));
        }

        let kind = self
            .handles
            .get(&id)
            .ok_or(AtlError::UnknownHandle(id))?
            .kind;
        let backend = self.dispatcher.get(kind)?;
        let handle = self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))?;
        backend.resume(handle).await?;

        self.resumable.remove(&id);
        self.persist(id)?;
        Ok(())
    }
}
