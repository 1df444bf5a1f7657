// Recognized configuration options (spec §6) with environment-variable
// override. Precedence: explicit `config()` call > environment > compile-time
// default, matching the original's `AXL_<KEY>` environment variables
// (see examples/original_source/src/axl_util.c and axl_keys.h).

use std::collections::HashMap;
use std::env;

use crate::error::{AtlError, Result};

/// I/O chunk size used by Sync, WorkerPool and the daemon copier.
pub const DEFAULT_FILE_BUF_SIZE: u64 = 1024 * 1024;
/// Bounded retry count for transient (EINTR/EAGAIN) I/O, matching
/// `AXL_OPEN_TRIES` in the original C implementation.
pub const DEFAULT_OPEN_TRIES: u32 = 5;
/// Upper bound on the daemon copier's idle-loop sleep, matching
/// `AXL_TRANSFER_SECS`.
pub const DEFAULT_DAEMON_POLL_SECS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    UInt(u64),
    Float(f64),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Configuration record consumed by `HandleRegistry::init` and updated by
/// the `config()` API operation.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub file_buf_size: u64,
    pub debug: i64,
    pub mkdir: bool,
    pub copy_metadata: bool,
    pub daemon_poll_secs: f64,
    pub pause_after_bytes: u64,
    pub verify_crc: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let mut cfg = Self {
            file_buf_size: DEFAULT_FILE_BUF_SIZE,
            debug: 0,
            mkdir: true,
            copy_metadata: false,
            daemon_poll_secs: DEFAULT_DAEMON_POLL_SECS,
            pause_after_bytes: 0,
            verify_crc: false,
        };
        cfg.apply_env();
        cfg
    }
}

const RECOGNIZED_KEYS: &[&str] = &[
    "file_buf_size",
    "debug",
    "mkdir",
    "copy_metadata",
    "daemon_poll_secs",
    "pause_after_bytes",
    "verify_crc",
];

impl GlobalConfig {
    fn apply_env(&mut self) {
        for key in RECOGNIZED_KEYS {
            let var = format!("AXL_{}", key.to_ascii_uppercase());
            if let Ok(val) = env::var(&var) {
                // Environment overrides are best-effort: an unparsable value
                // is logged and the compiled-in default is kept rather than
                // failing `init`.
                if let Err(e) = self.set_raw(key, &val) {
                    tracing::warn!("ignoring invalid {}={}: {}", var, val, e);
                }
            }
        }
    }

    /// Applies a mapping of option name to string value, as the public
    /// `config()` API operation does, and returns the previous mapping for
    /// the keys that were recognized.
    pub fn apply(&mut self, updates: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        let mut previous = HashMap::new();
        for (key, value) in updates {
            let prev = self.get_raw(key)?;
            self.set_raw(key, value)?;
            previous.insert(key.clone(), prev);
        }
        Ok(previous)
    }

    fn get_raw(&self, key: &str) -> Result<String> {
        Ok(match key {
            "file_buf_size" => self.file_buf_size.to_string(),
            "debug" => self.debug.to_string(),
            "mkdir" => self.mkdir.to_string(),
            "copy_metadata" => self.copy_metadata.to_string(),
            "daemon_poll_secs" => self.daemon_poll_secs.to_string(),
            "pause_after_bytes" => self.pause_after_bytes.to_string(),
            "verify_crc" => self.verify_crc.to_string(),
            other => return Err(AtlError::UnknownOption(other.to_string())),
        })
    }

    fn set_raw(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = || AtlError::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "file_buf_size" => self.file_buf_size = value.parse().map_err(|_| invalid())?,
            "debug" => self.debug = value.parse().map_err(|_| invalid())?,
            "mkdir" => self.mkdir = parse_bool(value).ok_or_else(invalid)?,
            "copy_metadata" => self.copy_metadata = parse_bool(value).ok_or_else(invalid)?,
            "daemon_poll_secs" => self.daemon_poll_secs = value.parse().map_err(|_| invalid())?,
            "pause_after_bytes" => self.pause_after_bytes = value.parse().map_err(|_| invalid())?,
            "verify_crc" => self.verify_crc = parse_bool(value).ok_or_else(invalid)?,
            other => return Err(AtlError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_compiled_in_constants() {
        // Clear any stray env vars so this test is hermetic.
        for key in RECOGNIZED_KEYS {
            std::env::remove_var(format!("AXL_{}", key.to_ascii_uppercase()));
        }
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.file_buf_size, DEFAULT_FILE_BUF_SIZE);
        assert!(cfg.mkdir);
        assert!(!cfg.copy_metadata);
    }

    #[test]
    fn apply_returns_previous_mapping() {
        let mut cfg = GlobalConfig::default();
        let mut updates = HashMap::new();
        updates.insert("copy_metadata".to_string(), "true".to_string());
        let previous = cfg.apply(&updates).unwrap();
        assert_eq!(previous.get("copy_metadata"), Some(&"false".to_string()));
        assert!(cfg.copy_metadata);
    }

    #[test]
    fn unknown_option_is_an_error() {
        let mut cfg = GlobalConfig::default();
        let mut updates = HashMap::new();
        updates.insert("bogus".to_string(), "1".to_string());
        assert!(cfg.apply(&updates).is_err());
    }
}
