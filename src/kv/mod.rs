// Typed, ordered, hierarchical key/value tree (spec §4.1).
//
// The real AXL sits on top of `kvtree`, a separate library the spec treats
// as an external black box: "get/set/unset by key or by integer-valued key;
// enumerate children in insertion order or sorted order; merge one subtree
// into another; pack/unpack to a byte buffer; atomic persist under an
// advisory file lock". No such crate is available in this workspace, so this
// module provides a small, self-contained implementation of exactly that
// contract — nothing more. The core never assumes thread safety from it;
// callers are responsible for external synchronization (`persist_locked` is
// the one operation that does its own locking, because that locking is part
// of the contract itself).

mod lock;

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{AtlError, Result};
use lock::LockedFile;

/// A typed leaf value. `ByteCount` and `UInt` are distinguished only for
/// documentation purposes at the call site (both are `u64` on the wire);
/// spec §4.1 lists them as distinct scalar kinds (integer, unsigned long,
/// bytecount, double, string, CRC32, opaque pointer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    UInt(u64),
    ByteCount(u64),
    Double(f64),
    Str(String),
    Crc32(u32),
    Opaque(Vec<u8>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) | Value::ByteCount(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_crc32(&self) -> Option<u32> {
        match self {
            Value::Crc32(v) => Some(*v),
            _ => None,
        }
    }
}

/// A node is either a typed leaf or an interior map to further nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Leaf(Value),
    Tree(Tree),
}

impl Node {
    pub fn as_tree(&self) -> Option<&Tree> {
        match self {
            Node::Tree(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tree_mut(&mut self) -> Option<&mut Tree> {
        match self {
            Node::Tree(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Node::Leaf(v) => Some(v),
            _ => None,
        }
    }
}

/// An ordered map from string key to child node. Iteration order is
/// insertion order by default; `sorted_keys` gives the alternative
/// lexicographic order the spec also requires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree(IndexMap<String, Node>);

impl Tree {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.0.get_mut(key)
    }

    pub fn get_tree(&self, key: &str) -> Option<&Tree> {
        self.get(key).and_then(Node::as_tree)
    }

    pub fn get_or_insert_tree(&mut self, key: &str) -> &mut Tree {
        self.0
            .entry(key.to_string())
            .or_insert_with(|| Node::Tree(Tree::new()))
            .as_tree_mut()
            .expect("key previously held a leaf value")
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(Node::as_leaf)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), Node::Leaf(value));
    }

    pub fn set_tree(&mut self, key: impl Into<String>, tree: Tree) {
        self.0.insert(key.into(), Node::Tree(tree));
    }

    pub fn unset(&mut self, key: &str) -> Option<Node> {
        self.0.shift_remove(key)
    }

    /// By-integer-valued-key convenience, used for `ID/<handle_id>` subtrees.
    pub fn get_tree_int(&self, key: &str, int_key: u64) -> Option<&Tree> {
        self.get_tree(key)?.get_tree(&int_key.to_string())
    }

    pub fn get_or_insert_tree_int(&mut self, key: &str, int_key: u64) -> &mut Tree {
        self.get_or_insert_tree(key)
            .get_or_insert_tree(&int_key.to_string())
    }

    /// Enumerate children in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.0.iter()
    }

    /// Enumerate children sorted lexicographically by key.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (&String, &Node)> {
        let sorted: BTreeMap<&String, &Node> = self.0.iter().collect();
        sorted.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merges `other` into this tree at `key`, overwriting any existing
    /// subtree of the same name (spec §4.1: "merge one subtree into
    /// another").
    pub fn merge_subtree(&mut self, key: impl Into<String>, other: Tree) {
        self.0.insert(key.into(), Node::Tree(other));
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AtlError::Other(e.into()))
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Tree::new());
        }
        serde_json::from_slice(bytes).map_err(|e| AtlError::Other(e.into()))
    }

    /// Reads the tree currently persisted at `path`, or an empty tree if the
    /// file does not exist or is empty yet.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Tree::unpack(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Tree::new()),
            Err(e) => Err(AtlError::io(path.display().to_string(), e)),
        }
    }

    /// Writes this tree to `path`, replacing any previous contents.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.pack()?;
        std::fs::write(path, bytes).map_err(|e| AtlError::persistence(path.display().to_string(), e))
    }

    /// Atomic read-modify-write under an exclusive advisory lock (spec
    /// §4.1): acquire the lock, read the current tree, let `mutate` update
    /// it in place, write the result back, release the lock. `mutate` may
    /// return any value to thread back to the caller.
    pub fn persist_locked<T>(path: &Path, mutate: impl FnOnce(&mut Tree) -> Result<T>) -> Result<T> {
        let mut locked = LockedFile::acquire(path)?;
        let mut bytes = Vec::new();
        locked
            .file()
            .read_to_end(&mut bytes)
            .map_err(|e| AtlError::io(path.display().to_string(), e))?;
        let mut tree = Tree::unpack(&bytes)?;

        let result = mutate(&mut tree)?;

        let new_bytes = tree.pack()?;
        let file = locked.file();
        file.set_len(0)
            .map_err(|e| AtlError::persistence(path.display().to_string(), e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| AtlError::persistence(path.display().to_string(), e))?;
        file.write_all(&new_bytes)
            .map_err(|e| AtlError::persistence(path.display().to_string(), e))?;
        file.sync_all()
            .map_err(|e| AtlError::persistence(path.display().to_string(), e))?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_get_unset_roundtrip() {
        let mut tree = Tree::new();
        tree.set("SIZE", Value::ByteCount(4096));
        assert_eq!(tree.get_value("SIZE").and_then(Value::as_u64), Some(4096));
        tree.unset("SIZE");
        assert!(tree.get_value("SIZE").is_none());
    }

    #[test]
    fn insertion_order_preserved() {
        let mut tree = Tree::new();
        tree.set("b", Value::Int(1));
        tree.set("a", Value::Int(2));
        let keys: Vec<_> = tree.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
        let sorted_keys: Vec<_> = tree.iter_sorted().map(|(k, _)| k.clone()).collect();
        assert_eq!(sorted_keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let mut tree = Tree::new();
        tree.set("BW", Value::Double(10.5));
        let sub = tree.get_or_insert_tree_int("ID", 7);
        sub.set("STATE", Value::Str("RUNNING".into()));

        let bytes = tree.pack().unwrap();
        let restored = Tree::unpack(&bytes).unwrap();
        assert_eq!(
            restored.get_value("BW").and_then(Value::as_f64),
            Some(10.5)
        );
        assert_eq!(
            restored
                .get_tree_int("ID", 7)
                .and_then(|t| t.get_value("STATE"))
                .and_then(Value::as_str),
            Some("RUNNING")
        );
    }

    #[test]
    fn persist_locked_is_read_modify_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.kv");

        Tree::persist_locked(&path, |tree| {
            tree.set("COMMAND", Value::Str("RUN".into()));
            Ok(())
        })
        .unwrap();

        Tree::persist_locked(&path, |tree| {
            assert_eq!(
                tree.get_value("COMMAND").and_then(Value::as_str),
                Some("RUN")
            );
            tree.set("STATE", Value::Str("RUNNING".into()));
            Ok(())
        })
        .unwrap();

        let reloaded = Tree::load(&path).unwrap();
        assert_eq!(
            reloaded.get_value("STATE").and_then(Value::as_str),
            Some("RUNNING")
        );
    }
}
