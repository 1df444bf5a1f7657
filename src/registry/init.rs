// init/finalize (spec §4.2).

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{AtlError, Result};
use crate::model::HandleState;
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Reads configuration from `config_path` (a flat `key=value` file, one
    /// option per line; unrecognized keys are rejected the same as through
    /// the `config()` API), establishes control paths, and reloads any
    /// persisted state file found there. Reentry after `finalize` is
    /// allowed; double-`init` without an intervening `finalize` is an error.
    pub async fn init(&mut self, config_path: Option<&Path>) -> Result<()> {
        if self.initialized {
            return Err(AtlError::AlreadyInitialized);
        }

        if let Some(path) = config_path {
            let updates = parse_config_file(path)?;
            self.config.lock().unwrap().apply(&updates)?;
        }

        self.dispatcher.init_all().await?;

        let state_path = &self.control.state_file_path;
        if state_path.exists() {
            let handles = crate::state_persistence::load_all(state_path)?;
            for handle in handles {
                let id = handle.id;
                let dispatched = handle.state == HandleState::Dispatched;
                self.next_id = self.next_id.max(id + 1);
                self.handles.insert(id, handle);
                if dispatched {
                    self.resumable.insert(id);
                    warn!("handle {} reloaded in Dispatched state; call resume() before test/wait", id);
                }
            }
            info!("reloaded {} handle(s) from {:?}", self.handles.len(), state_path);
        }
        self.default_state_file_path = Some(state_path.clone());

        self.initialized = true;
        Ok(())
    }

    /// Finalizes every backend and persists the registry. Handles still in
    /// `Dispatched` are left with their on-disk state intact so a future
    /// `init` + `resume` can continue them (spec §4.2).
    pub async fn finalize(&mut self) -> Result<()> {
        for id in self.handles.keys().copied().collect::<Vec<_>>() {
            self.persist(id)?;
        }
        self.dispatcher.finalize_all().await?;
        self.initialized = false;
        Ok(())
    }
}

fn parse_config_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| AtlError::io(path.display().to_string(), e))?;
    let mut updates = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        updates.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(updates)
}
