// Library side of the external daemon protocol (spec §4.6).
//
// The only channel between this backend and the `DaemonCopier` process is the
// *transfer file*, a KV tree persisted through `kv::Tree::persist_locked`.
// Schema (spec §4.6):
//
//   BW, PERCENT, COMMAND, STATE, FLAG
//   ID/<handle_id>/FILES/<source>/{DESTINATION, SIZE, WRITTEN, ERROR}

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::backend::{Backend, TestOutcome};
use crate::error::{AtlError, Result};
use crate::kv::{Tree, Value};
use crate::model::{FileState, Handle};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const STATE_POLL_TRIES: u32 = 40;

pub struct DaemonBackend {
    transfer_file_path: PathBuf,
}

impl DaemonBackend {
    pub fn new(transfer_file_path: PathBuf) -> Self {
        Self { transfer_file_path }
    }

    /// Merges `files` into the transfer file's `ID/<id>/FILES` subtree.
    ///
    /// `WRITTEN` is never regressed: a record already present (e.g. one the
    /// `DaemonCopier` has been advancing while the library process was
    /// restarting) keeps `max(existing WRITTEN, entry.bytes_transferred)`,
    /// since the in-memory `entry.bytes_transferred` on a reloaded handle is
    /// only as fresh as the last state-file snapshot (`registry/test.rs`
    /// persists on terminal transitions only) and is commonly stale relative
    /// to the daemon's on-disk progress. Spec §8 property 5 requires
    /// `WRITTEN` to be non-decreasing across restarts; this is also what
    /// `start`'s initial dispatch relies on to publish `SIZE`/`DESTINATION`
    /// for a brand-new record, where no existing `WRITTEN` is present yet.
    fn merge_handle_files(
        tree: &mut Tree,
        id: crate::model::HandleId,
        files: &indexmap::IndexMap<PathBuf, crate::model::FileEntry>,
    ) {
        let files_tree = tree.get_or_insert_tree_int("ID", id).get_or_insert_tree("FILES");
        for (source, entry) in files {
            let key = source.display().to_string();
            let existing_written = files_tree
                .get_tree(&key)
                .and_then(|t| t.get_value("WRITTEN"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let record = files_tree.get_or_insert_tree(&key);
            record.set(
                "DESTINATION",
                Value::Str(entry.destination.display().to_string()),
            );
            record.set("SIZE", Value::ByteCount(entry.size));
            record.set(
                "WRITTEN",
                Value::ByteCount(existing_written.max(entry.bytes_transferred)),
            );
        }
    }

    fn read_outcome(tree: &Tree, handle: &mut Handle) -> TestOutcome {
        let mut any_error = false;
        let mut all_done = true;

        let Some(files_tree) = tree.get_tree_int("ID", handle.id).and_then(|t| t.get_tree("FILES"))
        else {
            return TestOutcome::InProgress;
        };

        for (source, entry) in handle.files.iter_mut() {
            let key = source.display().to_string();
            let Some(record) = files_tree.get_tree(&key) else {
                all_done = false;
                continue;
            };
            if let Some(Value::Str(msg)) = record.get_value("ERROR").cloned() {
                entry.mark_error(msg);
                any_error = true;
                continue;
            }
            let written = record
                .get_value("WRITTEN")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            entry.bytes_transferred = written;
            if written >= entry.size {
                entry.state = FileState::AtDestination;
            } else {
                entry.state = FileState::InProgress;
                all_done = false;
            }
        }

        if any_error {
            TestOutcome::CompletedError
        } else if all_done {
            TestOutcome::CompletedSuccess
        } else {
            TestOutcome::InProgress
        }
    }
}

#[async_trait]
impl Backend for DaemonBackend {
    async fn start(&self, handle: &mut Handle) -> Result<()> {
        let path = self.transfer_file_path.clone();
        let handle_files = handle.files.clone();
        let id = handle.id;
        tokio::task::spawn_blocking(move || {
            Tree::persist_locked(&path, |tree| {
                Self::merge_handle_files(tree, id, &handle_files);
                tree.set("COMMAND", Value::Str("RUN".to_string()));
                tree.unset("FLAG");
                Ok(())
            })
        })
        .await
        .map_err(|e| AtlError::BackendFailure(e.to_string()))??;

        for entry in handle.files.values_mut() {
            if entry.state == FileState::AtSource {
                entry.state = FileState::InProgress;
            }
        }

        // Bounded poll for STATE=RUNNING (spec §4.6 "wait (bounded poll)").
        for _ in 0..STATE_POLL_TRIES {
            let tree = load_blocking(&self.transfer_file_path).await?;
            if matches!(tree.get_value("STATE").and_then(Value::as_str), Some("RUNNING")) {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn test(&self, handle: &mut Handle) -> Result<TestOutcome> {
        let tree = load_blocking(&self.transfer_file_path).await?;
        Ok(Self::read_outcome(&tree, handle))
    }

    async fn wait(&self, handle: &mut Handle) -> Result<TestOutcome> {
        loop {
            let outcome = self.test(handle).await?;
            if outcome != TestOutcome::InProgress {
                return Ok(outcome);
            }
            sleep(POLL_INTERVAL.max(Duration::from_secs(1))).await;
        }
    }

    async fn cancel(&self, handle: &mut Handle) -> Result<()> {
        let path = self.transfer_file_path.clone();
        let id = handle.id;
        tokio::task::spawn_blocking(move || {
            Tree::persist_locked(&path, |tree| {
                tree.set("COMMAND", Value::Str("STOP".to_string()));
                Ok(())
            })
        })
        .await
        .map_err(|e| AtlError::BackendFailure(e.to_string()))??;

        for _ in 0..STATE_POLL_TRIES {
            let tree = load_blocking(&self.transfer_file_path).await?;
            if matches!(tree.get_value("STATE").and_then(Value::as_str), Some("STOPPED")) {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        let path = self.transfer_file_path.clone();
        tokio::task::spawn_blocking(move || {
            Tree::persist_locked(&path, |tree| {
                if let Some(id_tree) = tree.get_mut("ID").and_then(|n| n.as_tree_mut()) {
                    id_tree.unset(&id.to_string());
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| AtlError::BackendFailure(e.to_string()))??;

        for entry in handle.files.values_mut() {
            if entry.state == FileState::InProgress {
                entry.state = FileState::Error;
                entry.error_message = Some("cancelled".to_string());
            }
        }
        Ok(())
    }

    async fn resume(&self, handle: &mut Handle) -> Result<()> {
        // Re-merge the handle's FILES subtree and reissue COMMAND=RUN (spec
        // SPEC_FULL §3, axl_daemon.c's need_transfer/find_file
        // continuation). `merge_handle_files` keeps whichever WRITTEN is
        // larger between the transfer file's existing value and this
        // handle's in-memory one, so the daemon's already-advanced offset is
        // never regressed by a reload that only knows an older snapshot.
        self.start(handle).await
    }

    async fn finalize(&self) -> Result<()> {
        let path = self.transfer_file_path.clone();
        tokio::task::spawn_blocking(move || {
            Tree::persist_locked(&path, |tree| {
                tree.set("COMMAND", Value::Str("EXIT".to_string()));
                Ok(())
            })
        })
        .await
        .map_err(|e| AtlError::BackendFailure(e.to_string()))??;

        for _ in 0..STATE_POLL_TRIES {
            let tree = load_blocking(&self.transfer_file_path).await?;
            if matches!(tree.get_value("STATE").and_then(Value::as_str), Some("EXITING")) {
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }
}

async fn load_blocking(path: &std::path::Path) -> Result<Tree> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || Tree::load(&path))
        .await
        .map_err(|e| AtlError::BackendFailure(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileEntry, TransferKind};
    use tempfile::tempdir;

    #[tokio::test]
    async fn start_writes_files_subtree_and_run_command() {
        let dir = tempdir().unwrap();
        let transfer_path = dir.path().join("transfer.kv");
        let backend = DaemonBackend::new(transfer_path.clone());

        let mut handle = Handle::new(9, TransferKind::Daemon, "t".into());
        let src = dir.path().join("a");
        let dst = dir.path().join("out-a");
        let mut entry = FileEntry::new(src.clone(), dst);
        entry.size = 128;
        handle.files.insert(src, entry);

        // Simulate the daemon ack'ing RUN so start()'s poll exits promptly.
        let ack_path = transfer_path.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let _ = Tree::persist_locked(&ack_path, |tree| {
                tree.set("STATE", Value::Str("RUNNING".to_string()));
                Ok(())
            });
        });

        backend.start(&mut handle).await.unwrap();
        let tree = Tree::load(&transfer_path).unwrap();
        assert_eq!(
            tree.get_value("COMMAND").and_then(Value::as_str),
            Some("RUN")
        );
        assert!(tree.get_tree_int("ID", 9).is_some());
    }

    #[tokio::test]
    async fn test_reports_completion_from_written_offsets() {
        let dir = tempdir().unwrap();
        let transfer_path = dir.path().join("transfer.kv");
        let backend = DaemonBackend::new(transfer_path.clone());

        let mut handle = Handle::new(3, TransferKind::Daemon, "t".into());
        let src = dir.path().join("a");
        let dst = dir.path().join("out-a");
        let mut entry = FileEntry::new(src.clone(), dst);
        entry.size = 10;
        handle.files.insert(src.clone(), entry);

        Tree::persist_locked(&transfer_path, |tree| {
            let files = tree.get_or_insert_tree_int("ID", 3).get_or_insert_tree("FILES");
            let record = files.get_or_insert_tree(&src.display().to_string());
            record.set("WRITTEN", Value::ByteCount(10));
            Ok(())
        })
        .unwrap();

        let outcome = backend.test(&mut handle).await.unwrap();
        assert_eq!(outcome, TestOutcome::CompletedSuccess);
    }

    #[test]
    fn merge_handle_files_never_regresses_written() {
        // Simulates a resume: the daemon has advanced WRITTEN to 40 while
        // the library process was down, but the reloaded handle's in-memory
        // bytes_transferred is still the stale dispatch-time 0 (spec §8
        // property 5: "WRITTEN is non-decreasing across restarts").
        let mut tree = Tree::new();
        let files = tree.get_or_insert_tree_int("ID", 7).get_or_insert_tree("FILES");
        let record = files.get_or_insert_tree("/src/a");
        record.set("WRITTEN", Value::ByteCount(40));
        record.set("SIZE", Value::ByteCount(100));

        let mut entries = indexmap::IndexMap::new();
        let mut entry = FileEntry::new(PathBuf::from("/src/a"), PathBuf::from("/dst/a"));
        entry.size = 100;
        entry.bytes_transferred = 0;
        entries.insert(PathBuf::from("/src/a"), entry);

        DaemonBackend::merge_handle_files(&mut tree, 7, &entries);

        let written = tree
            .get_tree_int("ID", 7)
            .and_then(|t| t.get_tree("FILES"))
            .and_then(|t| t.get_tree("/src/a"))
            .and_then(|t| t.get_value("WRITTEN"))
            .and_then(Value::as_u64);
        assert_eq!(written, Some(40));
    }

    #[test]
    fn merge_handle_files_publishes_in_memory_written_for_new_record() {
        let mut tree = Tree::new();
        let mut entries = indexmap::IndexMap::new();
        let mut entry = FileEntry::new(PathBuf::from("/src/b"), PathBuf::from("/dst/b"));
        entry.size = 100;
        entry.bytes_transferred = 25;
        entries.insert(PathBuf::from("/src/b"), entry);

        DaemonBackend::merge_handle_files(&mut tree, 1, &entries);

        let written = tree
            .get_tree_int("ID", 1)
            .and_then(|t| t.get_tree("FILES"))
            .and_then(|t| t.get_tree("/src/b"))
            .and_then(|t| t.get_value("WRITTEN"))
            .and_then(Value::as_u64);
        assert_eq!(written, Some(25));
    }
}
