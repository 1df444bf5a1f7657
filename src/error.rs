// Error taxonomy for the transfer library
//
// Per-handle and per-file failures never abort the process; they are
// captured as typed variants here (or, for vendor/backend plumbing, folded
// into `Other`) and surface to the caller from the public registry API.

use thiserror::Error;

use crate::model::{HandleId, HandleState};

pub type Result<T> = std::result::Result<T, AtlError>;

#[derive(Debug, Error)]
pub enum AtlError {
    #[error("unknown transfer kind: {0}")]
    UnknownKind(String),

    #[error("handle {0} does not exist")]
    UnknownHandle(HandleId),

    #[error("handle {id} is in state {actual:?}, operation requires {expected}")]
    StateMachine {
        id: HandleId,
        actual: HandleState,
        expected: &'static str,
    },

    #[error("source and destination are identical: {0}")]
    SourceEqualsDestination(String),

    #[error("source already added to handle: {0}")]
    DuplicateSource(String),

    #[error("source not readable: {0}")]
    UnreadableSource(String),

    #[error("unknown configuration option: {0}")]
    UnknownOption(String),

    #[error("registry is already initialized; call finalize() first")]
    AlreadyInitialized,

    #[error("invalid configuration value for {key}: {value}")]
    InvalidConfigValue { key: String, value: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist state to {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend {kind:?} does not support resume")]
    ResumeUnsupported { kind: crate::model::TransferKind },

    #[error("handle {0} was reloaded from a persisted state file in Dispatched state; call resume() first")]
    ResumeRequired(HandleId),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AtlError {
    /// Builds an `Io` error whose `path` is annotated with the underlying
    /// POSIX errno symbol when recognized (e.g. `/foo/bar [ENOENT]`), so the
    /// per-file error message stored on a `FileEntry` stays greppable the way
    /// the original C implementation's `perror`-style output was (spec §6
    /// scenario S6: "per-file Error with a message containing ENOENT").
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let mut path = path.into();
        if let Some(symbol) = source.raw_os_error().and_then(errno_symbol) {
            path = format!("{path} [{symbol}]");
        }
        AtlError::Io { path, source }
    }

    pub fn persistence(path: impl Into<String>, source: std::io::Error) -> Self {
        AtlError::Persistence {
            path: path.into(),
            source,
        }
    }

    pub fn state_machine(id: HandleId, actual: HandleState, expected: &'static str) -> Self {
        AtlError::StateMachine {
            id,
            actual,
            expected,
        }
    }
}

fn errno_symbol(code: i32) -> Option<&'static str> {
    match code {
        libc::ENOENT => Some("ENOENT"),
        libc::EACCES => Some("EACCES"),
        libc::EEXIST => Some("EEXIST"),
        libc::ENOTDIR => Some("ENOTDIR"),
        libc::EISDIR => Some("EISDIR"),
        libc::ENOSPC => Some("ENOSPC"),
        libc::EROFS => Some("EROFS"),
        libc::EPERM => Some("EPERM"),
        libc::EIO => Some("EIO"),
        libc::EMFILE => Some("EMFILE"),
        libc::ENFILE => Some("ENFILE"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_source_error_message_contains_enoent() {
        let io_err = std::fs::File::open("/no/such/path/here").unwrap_err();
        assert_eq!(io_err.raw_os_error(), Some(libc::ENOENT));
        let err = AtlError::io("/no/such/path/here", io_err);
        assert!(err.to_string().contains("ENOENT"));
    }
}
