// wait / wait_timeout (spec §4.2, §5, §9 "optional wait_timeout").

use std::time::Duration;

use tokio::time::sleep;

use crate::backend::TestOutcome;
use crate::error::{AtlError, Result};
use crate::model::{HandleId, HandleState};
use crate::registry::HandleRegistry;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

impl HandleRegistry {
    /// Legal in `Dispatched`, `Completed`, `Error`, `Cancelled`. Blocks by
    /// repeated `test` with a one-second back-off until the handle reaches a
    /// terminal state. Idempotent on already-terminal handles. A handle
    /// reloaded from a persisted state file while still `Dispatched` fails
    /// immediately with `ResumeRequired`, surfaced through the inner `test`
    /// call.
    pub async fn wait(&mut self, id: HandleId) -> Result<()> {
        let state = self.handle_state(id)?;
        match state {
            HandleState::Completed => return Ok(()),
            HandleState::Error => return Err(AtlError::BackendFailure(format!("handle {id} terminated in Error"))),
            HandleState::Cancelled => return Ok(()),
            HandleState::Dispatched => {}
            HandleState::Created => {
                return Err(AtlError::state_machine(
                    id,
                    state,
                    "Dispatched, Completed, Error, or Cancelled",
                ))
            }
        }

        loop {
            match self.test(id).await? {
                TestOutcome::InProgress => sleep(POLL_INTERVAL).await,
                TestOutcome::CompletedSuccess => return Ok(()),
                TestOutcome::CompletedError => {
                    return Err(AtlError::BackendFailure(format!("handle {id} terminated in Error")))
                }
            }
        }
    }

    /// Supplemented (spec §5: "an optional wait_timeout(id, duration) is
    /// permitted"). On timeout, leaves the handle in its current state and
    /// returns `Ok(TestOutcome::InProgress)` rather than erroring.
    pub async fn wait_timeout(&mut self, id: HandleId, timeout: Duration) -> Result<TestOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outcome = self.test(id).await?;
            if outcome != TestOutcome::InProgress || tokio::time::Instant::now() >= deadline {
                return Ok(outcome);
            }
            sleep(POLL_INTERVAL.min(deadline - tokio::time::Instant::now())).await;
        }
    }
}
