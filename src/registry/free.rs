// free (spec §4.2).

use crate::error::{AtlError, Result};
use crate::model::{HandleId, HandleState};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Legal only in a terminal state. `Created` counts as terminal for a
    /// never-dispatched handle (spec §4.2). Removes the handle from the
    /// registry and releases any backend-held resources for it.
    pub async fn free(&mut self, id: HandleId) -> Result<()> {
        let state = self.handle_state(id)?;
        let freeable = state.is_terminal() || state == HandleState::Created;
        if !freeable {
            return Err(AtlError::state_machine(id, state, "a terminal state"));
        }

        let kind = self
            .handles
            .get(&id)
            .ok_or(AtlError::UnknownHandle(id))?
            .kind;
        if let Ok(backend) = self.dispatcher.get(kind) {
            if let Some(handle) = self.handles.get_mut(&id) {
                backend.free(handle).await?;
            }
        }

        let state_file = self
            .handles
            .get(&id)
            .and_then(|h| h.state_file_path.clone())
            .or_else(|| self.default_state_file_path.clone());

        self.handles.shift_remove(&id);
        self.resumable.remove(&id);
        if let Some(path) = state_file {
            crate::state_persistence::forget_handle(&path, id)?;
        }
        Ok(())
    }
}
