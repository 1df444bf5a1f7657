// add (spec §4.2).

use std::path::Path;

use crate::error::{AtlError, Result};
use crate::model::{FileEntry, HandleId, HandleState};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Legal only in `Created`. Rejects `source == destination`, an
    /// unreadable `source`, or a `source` already present in the handle.
    pub async fn add(&mut self, id: HandleId, source: &Path, destination: &Path) -> Result<()> {
        let handle = self.get_mut(id)?;
        if handle.state != HandleState::Created {
            return Err(AtlError::state_machine(id, handle.state, "Created"));
        }

        if source == destination {
            return Err(AtlError::SourceEqualsDestination(
                source.display().to_string(),
            ));
        }
        if handle.files.contains_key(source) {
            return Err(AtlError::DuplicateSource(source.display().to_string()));
        }
        if std::fs::File::open(source).is_err() {
            return Err(AtlError::UnreadableSource(source.display().to_string()));
        }

        handle
            .files
            .insert(source.to_path_buf(), FileEntry::new(source.to_path_buf(), destination.to_path_buf()));
        self.persist(id)?;
        Ok(())
    }
}
