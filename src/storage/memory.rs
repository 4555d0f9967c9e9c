use super::{normalize_host, HostActivity, Storage, StorageError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug)]
struct HostEntry {
    targets: BTreeSet<String>,
    idle: bool,
    in_flight: u64,
    last_activity: DateTime<Utc>,
}

impl HostEntry {
    fn new() -> Self {
        Self {
            targets: BTreeSet::new(),
            idle: false,
            in_flight: 0,
            last_activity: Utc::now(),
        }
    }
}

/// Volatile routing store for single-instance deployments.
///
/// One coarse lock guards the whole table. It is only held for the duration
/// of a single method, so callers may chain operations on the same host
/// (e.g. `target_add` then `idle_set`) without deadlocking.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn host_list(&self) -> Result<Vec<String>, StorageError> {
        let mut hosts: Vec<String> = self.hosts.lock().keys().cloned().collect();
        hosts.sort();
        Ok(hosts)
    }

    fn idle_get(&self, host: &str) -> Result<bool, StorageError> {
        let host = normalize_host(host)?;
        Ok(self.hosts.lock().get(&host).map(|e| e.idle).unwrap_or(false))
    }

    fn idle_set(&self, host: &str, idle: bool) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        self.hosts.lock().entry(host).or_insert_with(HostEntry::new).idle = idle;
        Ok(())
    }

    fn request_begin(&self, host: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        if let Some(entry) = self.hosts.lock().get_mut(&host) {
            entry.in_flight += 1;
            entry.last_activity = Utc::now();
        }
        Ok(())
    }

    fn request_end(&self, host: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        if let Some(entry) = self.hosts.lock().get_mut(&host) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.last_activity = Utc::now();
        }
        Ok(())
    }

    fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let mut hosts: Vec<String> = self
            .hosts
            .lock()
            .iter()
            .filter(|(_, e)| !e.idle && e.in_flight == 0 && e.last_activity < cutoff)
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    fn idle_if_stale(&self, host: &str, cutoff: DateTime<Utc>) -> Result<bool, StorageError> {
        let host = normalize_host(host)?;
        match self.hosts.lock().get_mut(&host) {
            Some(e) if !e.idle && e.in_flight == 0 && e.last_activity < cutoff => {
                e.idle = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn target_add(&self, host: &str, target: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        self.hosts
            .lock()
            .entry(host)
            .or_insert_with(HostEntry::new)
            .targets
            .insert(target.to_string());
        Ok(())
    }

    fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError> {
        let host = normalize_host(host)?;
        Ok(self
            .hosts
            .lock()
            .get(&host)
            .map(|e| e.targets.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        if let Some(entry) = self.hosts.lock().get_mut(&host) {
            entry.targets.remove(target);
        }
        Ok(())
    }

    fn activity(&self, host: &str) -> Result<Option<HostActivity>, StorageError> {
        let host = normalize_host(host)?;
        Ok(self.hosts.lock().get(&host).map(|e| HostActivity {
            idle: e.idle,
            in_flight: e.in_flight,
            last_activity: e.last_activity,
        }))
    }
}
