//! Routing store: host to target mappings plus per-host idle and activity state
//!
//! Two interchangeable backends implement [`Storage`]:
//! - [`MemoryStorage`]: process-local map behind a mutex, for single-instance setups
//! - [`SqliteStorage`]: durable tables in a shared SQLite database, for
//!   multiple router instances sharing state
//!
//! Hosts are case-insensitive; every backend normalises them with
//! [`normalize_host`] before touching its tables.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::{Database, SqliteCertCache, SqliteStorage};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Snapshot of a host's idle and activity state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostActivity {
    pub idle: bool,
    pub in_flight: u64,
    pub last_activity: DateTime<Utc>,
}

/// Routing table operations shared by every backend.
///
/// All methods must be safe to call concurrently from any listener task.
pub trait Storage: Send + Sync {
    /// Every host the store has state for
    fn host_list(&self) -> Result<Vec<String>, StorageError>;

    /// Idle flag for a host; unknown hosts are not idle
    fn idle_get(&self, host: &str) -> Result<bool, StorageError>;

    /// Set the idle flag, creating the host entry if needed
    fn idle_set(&self, host: &str, idle: bool) -> Result<(), StorageError>;

    /// Count a request in and refresh the activity timestamp
    fn request_begin(&self, host: &str) -> Result<(), StorageError>;

    /// Count a request out; the counter never drops below zero
    fn request_end(&self, host: &str) -> Result<(), StorageError>;

    /// Hosts with no in-flight requests, not idle, and no activity since `cutoff`
    fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError>;

    /// Mark a host idle only if it is still stale, as one atomic step.
    ///
    /// Returns false when a request began since the host was listed stale.
    fn idle_if_stale(&self, host: &str, cutoff: DateTime<Utc>) -> Result<bool, StorageError>;

    fn target_add(&self, host: &str, target: &str) -> Result<(), StorageError>;

    fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError>;

    /// Removing a target that is not present succeeds
    fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError>;

    fn activity(&self, host: &str) -> Result<Option<HostActivity>, StorageError>;
}

/// Lowercase a host and strip a trailing dot; empty hosts are rejected
pub fn normalize_host(host: &str) -> Result<String, StorageError> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(StorageError::InvalidHost(host));
    }
    Ok(host)
}
