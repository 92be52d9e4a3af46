//! Local key-value store for records that must survive a reload.
//!
//! Holds the "recently authenticated" timestamp used to tolerate transient
//! identity nulls and the synthetic user record for the test-mode bypass.
//! The file backend rewrites a single JSON object on every write; the record
//! count is tiny so there is nothing to batch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

/// Store key for the last successful sign-in, in milliseconds since Unix epoch.
pub const LAST_AUTHENTICATED_KEY: &str = "auth:last_authenticated_at";

/// Store key for the test-mode synthetic user record (JSON).
pub const SYNTHETIC_USER_KEY: &str = "e2e:synthetic_user";

pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

// =============================================================================
// FILE
// =============================================================================

/// JSON-object file store. Read errors start empty; write errors are logged, not fatal.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "local store unreadable; starting empty");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "local store unreadable; starting empty");
                HashMap::new()
            }
        };
        Self { path, entries: Mutex::new(entries) }
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        let body = match serde_json::to_string_pretty(entries) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "local store serialize failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, body) {
            warn!(error = %e, path = %self.path.display(), "local store write failed");
        }
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
