// Asynchronous Transfer Library (ATL)
//
// A non-blocking file-set transfer engine for HPC checkpoint/restart and
// staging workflows: group files into a named transfer handle, dispatch it
// through one of several backends (in-process sync copy, a bounded worker
// pool, an external daemon process, or a vendor transfer engine), then poll
// or block for completion.

pub mod backend;
pub mod config;
pub mod daemon_copier;
pub mod error;
pub mod fileio;
pub mod kv;
pub mod model;
pub mod registry;
pub mod state_persistence;

pub use error::{AtlError, Result};
pub use model::{FileEntry, FileState, Handle, HandleId, HandleState, TransferKind};
pub use registry::HandleRegistry;
