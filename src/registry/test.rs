// test (spec §4.2, §9 Open Question).

use crate::backend::TestOutcome;
use crate::error::{AtlError, Result};
use crate::model::{HandleId, HandleState};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Non-blocking. Legal in `Dispatched`, `Completed`, `Error`.
    ///
    /// Per the spec's Open Question on this call, a handle that is already
    /// terminal (`Completed`/`Error`) is observational: it returns the
    /// current terminal state rather than erroring, matching "treat as
    /// observational". `Created` and `Cancelled` remain hard errors since
    /// neither is listed as legal. A handle reloaded from a persisted state
    /// file while still `Dispatched` rejects `test` until `resume`d.
    pub async fn test(&mut self, id: HandleId) -> Result<TestOutcome> {
        let state = self.handle_state(id)?;
        match state {
            HandleState::Completed => return Ok(TestOutcome::CompletedSuccess),
            HandleState::Error => return Ok(TestOutcome::CompletedError),
            HandleState::Dispatched => {}
            HandleState::Created | HandleState::Cancelled => {
                return Err(AtlError::state_machine(id, state, "Dispatched, Completed, or Error"));
            }
        }
        if self.resumable.contains(&id) {
            return Err(AtlError::ResumeRequired(id));
        }

        let kind = self
            .handles
            .get(&id)
            .ok_or(AtlError::UnknownHandle(id))?
            .kind;
        let backend = self.dispatcher.get(kind)?;
        let handle = self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))?;
        let outcome = backend.test(handle).await?;

        if outcome != TestOutcome::InProgress {
            let handle = self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))?;
            handle.state = match outcome {
                TestOutcome::CompletedSuccess => HandleState::Completed,
                TestOutcome::CompletedError => HandleState::Error,
                TestOutcome::InProgress => unreachable!(),
            };
            self.persist(id)?;
        }

        Ok(outcome)
    }
}
