// config (spec §6).

use std::collections::HashMap;

use crate::error::Result;
use crate::registry::HandleRegistry;

impl HandleRegistry {
    /// Applies a mapping of option name to string value; returns the
    /// previous mapping for the keys that were recognized.
    pub fn config(&mut self, updates: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        self.config.lock().unwrap().apply(updates)
    }
}
