// cancel / stop (spec §4.2, Testable Property 3).

use crate::error::{AtlError, Result};
use crate::model::{HandleId, HandleState};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Idempotent: calling `cancel` on an already-terminal handle is a
    /// no-op returning `ok` (Testable Property 3). Otherwise calls the
    /// backend's (required-idempotent) `cancel` and transitions to
    /// `Cancelled`.
    pub async fn cancel(&mut self, id: HandleId) -> Result<()> {
        let state = self.handle_state(id)?;
        if state.is_terminal() {
            return Ok(());
        }

        if state == HandleState::Dispatched {
            let kind = self
                .handles
                .get(&id)
                .ok_or(AtlError::UnknownHandle(id))?
                .kind;
            let backend = self.dispatcher.get(kind)?;
            let handle = self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))?;
            backend.cancel(handle).await?;
        }

        let handle = self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))?;
        handle.state = HandleState::Cancelled;
        self.persist(id)?;
        Ok(())
    }

    /// Cancels every non-terminal handle; used on shutdown.
    pub async fn stop(&mut self) -> Result<()> {
        let ids: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, h)| !h.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.cancel(id).await?;
        }
        Ok(())
    }
}
