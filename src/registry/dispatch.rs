// dispatch (spec §4.2).

use crate::error::{AtlError, Result};
use crate::fileio;
use crate::model::{HandleId, HandleState};
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Legal only in `Created`. For each file: creates parent directories of
    /// `destination` idempotently (if `mkdir` is enabled), captures source
    /// metadata (if `copy_metadata` is enabled), records `size`, computes
    /// CRC32 (if `verify_crc` is enabled), then calls the backend's `start`.
    /// Transitions to `Dispatched` on backend success, `Error` otherwise.
    pub async fn dispatch(&mut self, id: HandleId) -> Result<()> {
        {
            let handle = self.get(id)?;
            if handle.state != HandleState::Created {
                return Err(AtlError::state_machine(id, handle.state, "Created"));
            }
        }

        let (mkdir, copy_metadata, verify_crc, buf_size) = {
            let cfg = self.config.lock().unwrap();
            (cfg.mkdir, cfg.copy_metadata, cfg.verify_crc, cfg.file_buf_size as usize)
        };

        let prepare_result = (|| -> Result<()> {
            let handle = self.get_mut(id)?;
            for entry in handle.files.values_mut() {
                if mkdir {
                    if let Some(parent) = entry.destination.parent() {
                        fileio::mkdir_p(parent)?;
                    }
                }
                let metadata = std::fs::metadata(&entry.source)
                    .map_err(|e| AtlError::io(entry.source.display().to_string(), e))?;
                entry.size = metadata.len();
                if copy_metadata {
                    entry.metadata = Some(fileio::capture_metadata(&entry.source)?);
                }
                if verify_crc {
                    entry.crc32 = Some(fileio::crc32_file(&entry.source, buf_size)?);
                }
            }
            Ok(())
        })();

        if let Err(e) = prepare_result {
            let handle = self.get_mut(id)?;
            handle.state = HandleState::Error;
            self.persist(id)?;
            return Err(e);
        }

        let kind = self
            .handles
            .get(&id)
            .ok_or(AtlError::UnknownHandle(id))?
            .kind;
        let backend = self.dispatcher.get(kind)?;
        let handle = self.handles.get_mut(&id).ok_or(AtlError::UnknownHandle(id))?;
        let start_result = backend.start(handle).await;

        let handle = self.get_mut(id)?;
        handle.state = if start_result.is_ok() {
            HandleState::Dispatched
        } else {
            HandleState::Error
        };
        self.persist(id)?;
        start_result
    }
}
