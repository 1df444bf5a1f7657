// Snapshot-on-transition and reload-on-init (spec §4.8).
//
// Schema (spec §6):
//   HANDLE:
//     <id>:
//       UID, UNAME, XFER_KIND, XFER_KIND_STR, STATE
//       FILES:
//         <source>: { DEST, STATUS, CRC, META: {...} }

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::{AtlError, Result};
use crate::kv::{Tree, Value};
use crate::model::{FileEntry, FileMetadata, FileState, Handle, HandleId, HandleState, TransferKind};

fn handle_state_to_int(state: HandleState) -> i64 {
    match state {
        HandleState::Created => 0,
        HandleState::Dispatched => 1,
        HandleState::Completed => 2,
        HandleState::Error => 3,
        HandleState::Cancelled => 4,
    }
}

fn handle_state_from_int(n: i64) -> Option<HandleState> {
    Some(match n {
        0 => HandleState::Created,
        1 => HandleState::Dispatched,
        2 => HandleState::Completed,
        3 => HandleState::Error,
        4 => HandleState::Cancelled,
        _ => return None,
    })
}

fn file_state_to_int(state: FileState) -> i64 {
    match state {
        FileState::AtSource => 0,
        FileState::InProgress => 1,
        FileState::AtDestination => 2,
        FileState::Error => 3,
    }
}

fn file_state_from_int(n: i64) -> Option<FileState> {
    Some(match n {
        0 => FileState::AtSource,
        1 => FileState::InProgress,
        2 => FileState::AtDestination,
        3 => FileState::Error,
        _ => return None,
    })
}

fn metadata_to_tree(meta: &FileMetadata) -> Tree {
    let mut t = Tree::new();
    t.set("MODE", Value::UInt(meta.mode as u64));
    t.set("UID", Value::UInt(meta.uid as u64));
    t.set("GID", Value::UInt(meta.gid as u64));
    t.set("ATIME_SECS", Value::Int(meta.atime_secs));
    t.set("ATIME_NSECS", Value::UInt(meta.atime_nsecs as u64));
    t.set("MTIME_SECS", Value::Int(meta.mtime_secs));
    t.set("MTIME_NSECS", Value::UInt(meta.mtime_nsecs as u64));
    t.set("CTIME_SECS", Value::Int(meta.ctime_secs));
    t.set("CTIME_NSECS", Value::UInt(meta.ctime_nsecs as u64));
    t
}

fn metadata_from_tree(t: &Tree) -> Option<FileMetadata> {
    Some(FileMetadata {
        mode: t.get_value("MODE")?.as_u64()? as u32,
        uid: t.get_value("UID")?.as_u64()? as u32,
        gid: t.get_value("GID")?.as_u64()? as u32,
        atime_secs: t.get_value("ATIME_SECS")?.as_i64()?,
        atime_nsecs: t.get_value("ATIME_NSECS")?.as_u64()? as u32,
        mtime_secs: t.get_value("MTIME_SECS")?.as_i64()?,
        mtime_nsecs: t.get_value("MTIME_NSECS")?.as_u64()? as u32,
        ctime_secs: t.get_value("CTIME_SECS")?.as_i64()?,
        ctime_nsecs: t.get_value("CTIME_NSECS")?.as_u64()? as u32,
    })
}

fn handle_to_tree(handle: &Handle) -> Tree {
    let mut record = Tree::new();
    record.set("UID", Value::UInt(handle.id));
    record.set("UNAME", Value::Str(handle.user_name.clone()));
    record.set("XFER_KIND_STR", Value::Str(handle.kind.as_str().to_string()));
    record.set("STATE", Value::Int(handle_state_to_int(handle.state)));

    let mut files = Tree::new();
    for (source, entry) in &handle.files {
        let mut file_tree = Tree::new();
        file_tree.set("DEST", Value::Str(entry.destination.display().to_string()));
        file_tree.set("STATUS", Value::Int(file_state_to_int(entry.state)));
        file_tree.set("SIZE", Value::ByteCount(entry.size));
        file_tree.set("WRITTEN", Value::ByteCount(entry.bytes_transferred));
        if let Some(crc) = entry.crc32 {
            file_tree.set("CRC", Value::Crc32(crc));
        }
        if let Some(msg) = &entry.error_message {
            file_tree.set("ERROR", Value::Str(msg.clone()));
        }
        if let Some(meta) = &entry.metadata {
            file_tree.set_tree("META", metadata_to_tree(meta));
        }
        files.set_tree(source.display().to_string(), file_tree);
    }
    record.set_tree("FILES", files);
    record
}

fn handle_from_tree(id: HandleId, record: &Tree) -> Option<Handle> {
    let kind = record
        .get_value("XFER_KIND_STR")
        .and_then(Value::as_str)
        .and_then(TransferKind::parse)?;
    let user_name = record
        .get_value("UNAME")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let state = record
        .get_value("STATE")
        .and_then(Value::as_i64)
        .and_then(handle_state_from_int)
        .unwrap_or(HandleState::Error);

    let mut handle = Handle::new(id, kind, user_name);
    handle.state = state;

    if let Some(files) = record.get_tree("FILES") {
        let mut map = IndexMap::new();
        for (source, node) in files.iter() {
            let Some(file_tree) = node.as_tree() else {
                continue;
            };
            let destination = file_tree
                .get_value("DEST")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mut entry = FileEntry::new(PathBuf::from(source), PathBuf::from(destination));
            entry.state = file_tree
                .get_value("STATUS")
                .and_then(Value::as_i64)
                .and_then(file_state_from_int)
                .unwrap_or(FileState::Error);
            entry.size = file_tree.get_value("SIZE").and_then(Value::as_u64).unwrap_or(0);
            entry.bytes_transferred = file_tree
                .get_value("WRITTEN")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            entry.crc32 = file_tree.get_value("CRC").and_then(Value::as_crc32);
            entry.error_message = file_tree
                .get_value("ERROR")
                .and_then(Value::as_str)
                .map(String::from);
            entry.metadata = file_tree.get_tree("META").and_then(metadata_from_tree);
            map.insert(PathBuf::from(source), entry);
        }
        handle.files = map;
    }

    Some(handle)
}

/// Writes `handle`'s current tree into the `HANDLE/<id>` subtree of the file
/// at `path`, preserving every other handle already persisted there.
pub fn snapshot_handle(path: &Path, handle: &Handle) -> Result<()> {
    let record = handle_to_tree(handle);
    let id = handle.id;
    Tree::persist_locked(path, move |tree| {
        tree.get_or_insert_tree("HANDLE").set_tree(id.to_string(), record);
        Ok(())
    })
}

/// Removes a freed handle's record from the persisted state file.
pub fn forget_handle(path: &Path, id: HandleId) -> Result<()> {
    Tree::persist_locked(path, move |tree| {
        if let Some(handle_tree) = tree.get_mut("HANDLE").and_then(|n| n.as_tree_mut()) {
            handle_tree.unset(&id.to_string());
        }
        Ok(())
    })
}

/// Loads every handle record from `path`. Returns an empty vector if the file
/// does not exist or holds no `HANDLE` subtree yet.
pub fn load_all(path: &Path) -> Result<Vec<Handle>> {
    let tree = Tree::load(path)?;
    let Some(handle_tree) = tree.get_tree("HANDLE") else {
        return Ok(Vec::new());
    };
    let mut handles = Vec::new();
    for (id_str, node) in handle_tree.iter() {
        let Some(record) = node.as_tree() else { continue };
        let id: HandleId = id_str
            .parse()
            .map_err(|_| AtlError::Persistence {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "non-numeric handle id"),
            })?;
        if let Some(handle) = handle_from_tree(id, record) {
            handles.push(handle);
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_preserves_files_and_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.kv");

        let mut handle = Handle::new(42, TransferKind::Sync, "alice".into());
        handle.state = HandleState::Dispatched;
        let src = PathBuf::from("/tmp/a");
        let dst = PathBuf::from("/tmp/out/a");
        let mut entry = FileEntry::new(src.clone(), dst);
        entry.size = 1024;
        entry.bytes_transferred = 512;
        entry.state = FileState::InProgress;
        handle.files.insert(src, entry);

        snapshot_handle(&path, &handle).unwrap();

        let loaded = load_all(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 42);
        assert_eq!(loaded[0].state, HandleState::Dispatched);
        assert_eq!(loaded[0].files.len(), 1);
        let (_, entry) = loaded[0].files.iter().next().unwrap();
        assert_eq!(entry.bytes_transferred, 512);
        assert_eq!(entry.size, 1024);
    }

    #[test]
    fn snapshotting_one_handle_preserves_another() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.kv");

        let a = Handle::new(1, TransferKind::Sync, "a".into());
        let b = Handle::new(2, TransferKind::Sync, "b".into());
        snapshot_handle(&path, &a).unwrap();
        snapshot_handle(&path, &b).unwrap();

        let loaded = load_all(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
