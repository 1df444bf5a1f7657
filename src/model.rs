// Core data model (spec §3)
//
// `Handle` owns every `FileEntry` it contains; backends never hold more than
// a cookie or an index into this structure (see DESIGN.md, "no cyclic
// ownership").

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Process-wide, monotonically increasing handle identifier.
pub type HandleId = u64;

/// Selects which backend drives a handle's transfers. Immutable per handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Sync,
    WorkerPool,
    Daemon,
    VendorA,
    VendorB,
    VendorC,
    StateFile,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Sync => "SYNC",
            TransferKind::WorkerPool => "WORKER_POOL",
            TransferKind::Daemon => "DAEMON",
            TransferKind::VendorA => "VENDOR_A",
            TransferKind::VendorB => "VENDOR_B",
            TransferKind::VendorC => "VENDOR_C",
            TransferKind::StateFile => "STATE_FILE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SYNC" => Some(TransferKind::Sync),
            "WORKER_POOL" | "PTHREAD" => Some(TransferKind::WorkerPool),
            "DAEMON" => Some(TransferKind::Daemon),
            "VENDOR_A" | "BBAPI" => Some(TransferKind::VendorA),
            "VENDOR_B" | "DATAWARP" => Some(TransferKind::VendorB),
            "VENDOR_C" | "NNFDM" => Some(TransferKind::VendorC),
            "STATE_FILE" => Some(TransferKind::StateFile),
            _ => None,
        }
    }
}

/// Handle-level lifecycle state (spec §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    Created,
    Dispatched,
    Completed,
    Error,
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandleState::Completed | HandleState::Error | HandleState::Cancelled
        )
    }
}

/// Per-file lifecycle state (spec §3 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    AtSource,
    InProgress,
    AtDestination,
    Error,
}

/// Captured POSIX metadata for a source file, recorded at dispatch when
/// `copy_metadata` is enabled and reapplied to the destination on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime_secs: i64,
    pub atime_nsecs: u32,
    pub mtime_secs: i64,
    pub mtime_nsecs: u32,
    pub ctime_secs: i64,
    pub ctime_nsecs: u32,
}

/// Opaque backend-defined datum attached to a file entry: a vendor session
/// cookie, a worker index, or nothing at all for backends that don't need one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendCookie {
    None,
    VendorSession(String),
    WorkerIndex(usize),
}

impl Default for BackendCookie {
    fn default() -> Self {
        BackendCookie::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub state: FileState,
    pub bytes_transferred: u64,
    /// Recorded once at dispatch time; never mutated afterward (invariant 6).
    pub size: u64,
    pub crc32: Option<u32>,
    pub error_message: Option<String>,
    pub metadata: Option<FileMetadata>,
    pub cookie: BackendCookie,
}

impl FileEntry {
    pub fn new(source: PathBuf, destination: PathBuf) -> Self {
        Self {
            source,
            destination,
            state: FileState::AtSource,
            bytes_transferred: 0,
            size: 0,
            crc32: None,
            error_message: None,
            metadata: None,
            cookie: BackendCookie::None,
        }
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.state = FileState::Error;
        self.error_message = Some(message.into());
    }
}

/// A named, typed collection of pending file copies.
///
/// `files` is keyed by source path (spec §3: "Mapping is keyed by source
/// path; attempting to add the same source twice is an error") and preserves
/// insertion order, which the Sync and WorkerPool backends rely on for
/// deterministic iteration and the Daemon backend's "ascending handle_id,
/// insertion order within a handle" scan (spec §4.6 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handle {
    pub id: HandleId,
    pub kind: TransferKind,
    pub user_name: String,
    pub state: HandleState,
    pub files: IndexMap<PathBuf, FileEntry>,
    pub state_file_path: Option<PathBuf>,
    /// Backend-specific bag, e.g. the vendor engine's per-handle session cookie.
    pub backend_bag: HashMap<String, String>,
}

impl Handle {
    pub fn new(id: HandleId, kind: TransferKind, user_name: String) -> Self {
        Self {
            id,
            kind,
            user_name,
            state: HandleState::Created,
            files: IndexMap::new(),
            state_file_path: None,
            backend_bag: HashMap::new(),
        }
    }

    /// Invariant 2: Completed implies every file reached AtDestination.
    pub fn all_files_at_destination(&self) -> bool {
        self.files
            .values()
            .all(|f| f.state == FileState::AtDestination)
    }

    /// Invariant 3: Error implies at least one file errored.
    pub fn any_file_errored(&self) -> bool {
        self.files.values().any(|f| f.state == FileState::Error)
    }

    /// Invariant 4: Cancelled implies no file is still InProgress.
    pub fn no_file_in_progress(&self) -> bool {
        !self
            .files
            .values()
            .any(|f| f.state == FileState::InProgress)
    }
}

/// Process-wide control paths, set once at `init`.
#[derive(Debug, Clone)]
pub struct ControlPaths {
    pub control_dir: PathBuf,
    pub state_file_path: PathBuf,
    pub transfer_file_path: PathBuf,
}

impl ControlPaths {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        let control_dir = control_dir.into();
        Self {
            state_file_path: control_dir.join("atl_state.kv"),
            transfer_file_path: control_dir.join("atl_transfer.kv"),
            control_dir,
        }
    }

    pub fn pid_file_path(&self) -> PathBuf {
        let mut s = self.transfer_file_path.clone().into_os_string();
        s.push(".pid");
        PathBuf::from(s)
    }
}

pub(crate) fn now_unix() -> (i64, u32) {
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    (dur.as_secs() as i64, dur.subsec_nanos())
}
