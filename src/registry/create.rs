// create (spec §4.2).

use std::path::PathBuf;

use crate::error::Result;
use crate::model::{Handle, HandleId, TransferKind};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Allocates a fresh `HandleId` and records `(kind, user_name, Created)`.
    /// If `state_file_path` is given, the handle is bound to that file for
    /// persistence after every transition; otherwise the registry-wide
    /// default established at `init` is used.
    pub async fn create(
        &mut self,
        kind: TransferKind,
        user_name: impl Into<String>,
        state_file_path: Option<PathBuf>,
    ) -> Result<HandleId> {
        let id = self.next_id;
        self.next_id += 1;

        let mut handle = Handle::new(id, kind, user_name.into());
        handle.state_file_path = state_file_path;
        self.handles.insert(id, handle);
        self.persist(id)?;
        Ok(id)
    }
}
