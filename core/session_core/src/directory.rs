//! Session directory used for discovery
//!
//! The directory is a shared, best-effort list of open sessions. Every
//! response is a stale snapshot: a listed candidate may be gone by the time
//! it is dialed, so callers treat failures as routine and never as fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::unix_millis;
use crate::state::Mode;

// ============================================================================
// Records and Errors
// ============================================================================

/// One advertised session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Rendezvous code of the advertising client
    pub code: String,
    pub mode: Mode,
    /// Set once the advertiser is in a session; such records are never dialed
    pub connected: bool,
    /// Last update, milliseconds since the Unix epoch
    pub last_seen_ms: u64,
}

impl DirectoryRecord {
    pub fn new(code: &str, mode: Mode) -> Self {
        DirectoryRecord {
            code: code.to_string(),
            mode,
            connected: false,
            last_seen_ms: unix_millis(),
        }
    }
}

/// Directory call failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The directory could not be reached at all
    Unreachable(String),
    /// No record exists for the code
    UnknownCode(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Unreachable(e) => write!(f, "directory unreachable: {}", e),
            DirectoryError::UnknownCode(code) => write!(f, "no directory record for '{}'", code),
        }
    }
}

impl std::error::Error for DirectoryError {}

// ============================================================================
// Directory Trait
// ============================================================================

/// Shared registry of open sessions
pub trait Directory: Send + Sync {
    /// Advertise `code` as open for `mode`
    fn register(&self, code: &str, mode: Mode) -> Result<(), DirectoryError>;

    /// Withdraw `code`. Fire-and-forget.
    fn unregister(&self, code: &str);

    fn mark_connected(&self, code: &str) -> Result<(), DirectoryError>;

    fn mark_available(&self, code: &str) -> Result<(), DirectoryError>;

    /// Every record advertised for `mode`
    fn list(&self, mode: Mode) -> Result<Vec<DirectoryRecord>, DirectoryError>;
}

// ============================================================================
// In-memory Directory
// ============================================================================

/// Directory kept in process memory, shared by every client of a simulation
pub struct MemoryDirectory {
    records: Mutex<HashMap<String, DirectoryRecord>>,
    reachable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        MemoryDirectory {
            records: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, DirectoryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), DirectoryError> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DirectoryError::Unreachable("directory offline".to_string()))
        }
    }

    /// Simulate the directory going offline or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Insert or replace a record directly
    pub fn insert(&self, record: DirectoryRecord) {
        self.records().insert(record.code.clone(), record);
    }

    pub fn get(&self, code: &str) -> Option<DirectoryRecord> {
        self.records().get(code).cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Remove records not updated within `max_age`, returning their codes
    pub fn prune_stale(&self, max_age: Duration) -> Vec<String> {
        let cutoff = unix_millis().saturating_sub(max_age.as_millis() as u64);
        let mut records = self.records();

        let stale: Vec<String> = records
            .values()
            .filter(|r| r.last_seen_ms < cutoff)
            .map(|r| r.code.clone())
            .collect();

        for code in &stale {
            records.remove(code);
            log::debug!("Pruned stale directory record '{}'", code);
        }

        stale
    }

    fn set_connected(&self, code: &str, connected: bool) -> Result<(), DirectoryError> {
        self.check_reachable()?;

        let mut records = self.records();
        let record = records
            .get_mut(code)
            .ok_or_else(|| DirectoryError::UnknownCode(code.to_string()))?;
        record.connected = connected;
        record.last_seen_ms = unix_millis();
        Ok(())
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory for MemoryDirectory {
    fn register(&self, code: &str, mode: Mode) -> Result<(), DirectoryError> {
        self.check_reachable()?;
        log::debug!("Registering '{}' for {} sessions", code, mode);
        self.insert(DirectoryRecord::new(code, mode));
        Ok(())
    }

    fn unregister(&self, code: &str) {
        if self.records().remove(code).is_some() {
            log::debug!("Unregistered '{}'", code);
        }
    }

    fn mark_connected(&self, code: &str) -> Result<(), DirectoryError> {
        self.set_connected(code, true)
    }

    fn mark_available(&self, code: &str) -> Result<(), DirectoryError> {
        self.set_connected(code, false)
    }

    fn list(&self, mode: Mode) -> Result<Vec<DirectoryRecord>, DirectoryError> {
        self.check_reachable()?;

        let mut listed: Vec<_> = self
            .records()
            .values()
            .filter(|r| r.mode == mode)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list_by_mode() {
        let directory = MemoryDirectory::new();
        directory.register("ABCDE", Mode::Text).unwrap();
        directory.register("FGHJK", Mode::Video).unwrap();
        directory.register("LMNPQ", Mode::Text).unwrap();

        let text = directory.list(Mode::Text).unwrap();
        let codes: Vec<_> = text.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["ABCDE", "LMNPQ"]);
        assert!(text.iter().all(|r| !r.connected));

        assert_eq!(directory.list(Mode::Video).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_connected_and_available() {
        let directory = MemoryDirectory::new();
        directory.register("ABCDE", Mode::Text).unwrap();

        directory.mark_connected("ABCDE").unwrap();
        assert!(directory.get("ABCDE").unwrap().connected);

        directory.mark_available("ABCDE").unwrap();
        assert!(!directory.get("ABCDE").unwrap().connected);
    }

    #[test]
    fn test_mark_unknown_code() {
        let directory = MemoryDirectory::new();
        assert_eq!(
            directory.mark_connected("ZZZZZ"),
            Err(DirectoryError::UnknownCode("ZZZZZ".to_string()))
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let directory = MemoryDirectory::new();
        directory.register("ABCDE", Mode::Text).unwrap();
        directory.unregister("ABCDE");
        directory.unregister("ABCDE");
        assert!(directory.is_empty());
    }

    #[test]
    fn test_unreachable_directory() {
        let directory = MemoryDirectory::new();
        directory.register("ABCDE", Mode::Text).unwrap();
        directory.set_reachable(false);

        assert!(matches!(
            directory.list(Mode::Text),
            Err(DirectoryError::Unreachable(_))
        ));
        assert!(directory.register("FGHJK", Mode::Text).is_err());
        assert!(directory.mark_connected("ABCDE").is_err());

        directory.set_reachable(true);
        assert_eq!(directory.list(Mode::Text).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_stale_records() {
        let directory = MemoryDirectory::new();
        directory.register("ABCDE", Mode::Text).unwrap();
        directory.insert(DirectoryRecord {
            code: "OLDXX".to_string(),
            mode: Mode::Text,
            connected: false,
            last_seen_ms: 1,
        });

        let pruned = directory.prune_stale(Duration::from_secs(60));

        assert_eq!(pruned, vec!["OLDXX".to_string()]);
        assert!(directory.get("ABCDE").is_some());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_record_serde_shape() {
        let record = DirectoryRecord {
            code: "ABCDE".to_string(),
            mode: Mode::Video,
            connected: true,
            last_seen_ms: 5,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["mode"], "video");
        assert_eq!(json["connected"], true);
    }
}
