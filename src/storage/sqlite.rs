//! SQLite-backed durable routing store and certificate cache
//!
//! Several router instances may point at the same database file; SQLite's own
//! locking (WAL journal plus a busy timeout) serialises their writes.

use super::{normalize_host, HostActivity, Storage, StorageError};
use crate::acme::CertCache;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared SQLite connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Backend(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!(path = %path.display(), "Routing database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Table names are interpolated into SQL, so only identifiers are accepted
fn validate_table(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StorageError::InvalidTable(name.to_string()));
    }
    Ok(())
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Durable routing store: `<table>_hosts` and `<table>_targets`
pub struct SqliteStorage {
    db: Database,
    hosts_table: String,
    targets_table: String,
}

impl SqliteStorage {
    pub fn new(db: Database, table: &str) -> Result<Self, StorageError> {
        validate_table(table)?;
        let storage = Self {
            db,
            hosts_table: format!("{}_hosts", table),
            targets_table: format!("{}_targets", table),
        };
        storage.create_tables()?;
        Ok(storage)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let conn = self.db.conn.lock();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {hosts} (
                host TEXT PRIMARY KEY,
                idle INTEGER NOT NULL DEFAULT 0,
                in_flight INTEGER NOT NULL DEFAULT 0,
                last_activity INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {targets} (
                host TEXT NOT NULL,
                target TEXT NOT NULL,
                PRIMARY KEY (host, target)
            );
            "#,
            hosts = self.hosts_table,
            targets = self.targets_table,
        ))?;
        debug!(hosts = %self.hosts_table, targets = %self.targets_table, "Routing tables ready");
        Ok(())
    }

    fn ensure_host(&self, conn: &Connection, host: &str) -> Result<(), StorageError> {
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (host, idle, in_flight, last_activity) VALUES (?1, 0, 0, ?2)",
                self.hosts_table
            ),
            params![host, to_millis(Utc::now())],
        )?;
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn host_list(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT host FROM {} ORDER BY host", self.hosts_table))?;
        let hosts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hosts)
    }

    fn idle_get(&self, host: &str) -> Result<bool, StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        let idle: Option<bool> = conn
            .query_row(
                &format!("SELECT idle FROM {} WHERE host = ?1", self.hosts_table),
                params![host],
                |row| row.get(0),
            )
            .optional()?;
        Ok(idle.unwrap_or(false))
    }

    fn idle_set(&self, host: &str, idle: bool) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        self.ensure_host(&conn, &host)?;
        conn.execute(
            &format!("UPDATE {} SET idle = ?2 WHERE host = ?1", self.hosts_table),
            params![host, idle],
        )?;
        Ok(())
    }

    fn request_begin(&self, host: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        conn.execute(
            &format!(
                "UPDATE {} SET in_flight = in_flight + 1, last_activity = ?2 WHERE host = ?1",
                self.hosts_table
            ),
            params![host, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    fn request_end(&self, host: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        conn.execute(
            &format!(
                "UPDATE {} SET in_flight = MAX(in_flight - 1, 0), last_activity = ?2 WHERE host = ?1",
                self.hosts_table
            ),
            params![host, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT host FROM {} WHERE idle = 0 AND in_flight = 0 AND last_activity < ?1 ORDER BY host",
            self.hosts_table
        ))?;
        let hosts = stmt
            .query_map(params![to_millis(cutoff)], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hosts)
    }

    fn idle_if_stale(&self, host: &str, cutoff: DateTime<Utc>) -> Result<bool, StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET idle = 1 WHERE host = ?1 AND idle = 0 AND in_flight = 0 AND last_activity < ?2",
                self.hosts_table
            ),
            params![host, to_millis(cutoff)],
        )?;
        Ok(changed == 1)
    }

    fn target_add(&self, host: &str, target: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        let mut conn = self.db.conn.lock();
        let tx = conn.transaction()?;
        self.ensure_host(&tx, &host)?;
        tx.execute(
            &format!("INSERT OR IGNORE INTO {} (host, target) VALUES (?1, ?2)", self.targets_table),
            params![host, target],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT target FROM {} WHERE host = ?1 ORDER BY target",
            self.targets_table
        ))?;
        let targets = stmt
            .query_map(params![host], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(targets)
    }

    fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        conn.execute(
            &format!("DELETE FROM {} WHERE host = ?1 AND target = ?2", self.targets_table),
            params![host, target],
        )?;
        Ok(())
    }

    fn activity(&self, host: &str) -> Result<Option<HostActivity>, StorageError> {
        let host = normalize_host(host)?;
        let conn = self.db.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT idle, in_flight, last_activity FROM {} WHERE host = ?1",
                    self.hosts_table
                ),
                params![host],
                |row| Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .optional()?;
        Ok(row.map(|(idle, in_flight, last)| HostActivity {
            idle,
            in_flight: in_flight.max(0) as u64,
            last_activity: from_millis(last),
        }))
    }
}

/// Certificate and ACME account cache kept in the durable database
pub struct SqliteCertCache {
    db: Database,
    table: String,
}

impl SqliteCertCache {
    pub fn new(db: Database, table: &str) -> Result<Self, StorageError> {
        validate_table(table)?;
        db.conn.lock().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );",
            table
        ))?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }
}

impl CertCache for SqliteCertCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.db.conn.lock();
        let data = conn
            .query_row(
                &format!("SELECT data FROM {} WHERE key = ?1", self.table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let conn = self.db.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (key, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                self.table
            ),
            params![key, data, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.db.conn.lock();
        conn.execute(&format!("DELETE FROM {} WHERE key = ?1", self.table), params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn storage() -> SqliteStorage {
        SqliteStorage::new(Database::open_in_memory().unwrap(), "routes").unwrap()
    }

    #[test]
    fn test_validate_table() {
        assert!(validate_table("routes").is_ok());
        assert!(validate_table("router_cache_2").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("2routes").is_err());
        assert!(validate_table("routes; DROP TABLE x").is_err());
    }

    #[test]
    fn test_targets_round_trip() {
        let store = storage();
        store.target_add("app.example.com", "http://10.0.0.1:3000").unwrap();
        let before = store.target_list("app.example.com").unwrap();

        store.target_add("App.Example.com", "http://10.0.0.2:3000").unwrap();
        store.target_add("app.example.com", "http://10.0.0.2:3000").unwrap();
        assert_eq!(store.target_list("app.example.com").unwrap().len(), 2);

        store.target_remove("app.example.com", "http://10.0.0.2:3000").unwrap();
        store.target_remove("app.example.com", "http://10.0.0.2:3000").unwrap();
        assert_eq!(store.target_list("app.example.com").unwrap(), before);
        assert!(store.target_list("unknown.example.com").unwrap().is_empty());
    }

    #[test]
    fn test_idle_and_activity() {
        let store = storage();
        assert!(!store.idle_get("app.example.com").unwrap());

        store.target_add("app.example.com", "http://10.0.0.1:3000").unwrap();
        store.idle_set("app.example.com", true).unwrap();
        assert!(store.idle_get("app.example.com").unwrap());

        store.request_begin("app.example.com").unwrap();
        store.request_begin("app.example.com").unwrap();
        let activity = store.activity("app.example.com").unwrap().unwrap();
        assert_eq!(activity.in_flight, 2);
        assert!(activity.idle);

        for _ in 0..3 {
            store.request_end("app.example.com").unwrap();
        }
        assert_eq!(store.activity("app.example.com").unwrap().unwrap().in_flight, 0);
    }

    #[test]
    fn test_stale_hosts() {
        let store = storage();
        store.target_add("quiet.example.com", "http://10.0.0.1:3000").unwrap();
        store.target_add("busy.example.com", "http://10.0.0.2:3000").unwrap();
        store.request_begin("busy.example.com").unwrap();

        let cutoff = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(store.stale(cutoff).unwrap(), vec!["quiet.example.com"]);
        assert_eq!(store.host_list().unwrap(), vec!["busy.example.com", "quiet.example.com"]);
    }

    #[test]
    fn test_idle_if_stale_rechecks_in_flight() {
        let store = storage();
        store.target_add("quiet.example.com", "http://10.0.0.1:3000").unwrap();
        store.target_add("busy.example.com", "http://10.0.0.2:3000").unwrap();
        let cutoff = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(store.stale(cutoff).unwrap().len(), 2);

        store.request_begin("busy.example.com").unwrap();

        assert!(store.idle_if_stale("quiet.example.com", cutoff).unwrap());
        assert!(store.idle_get("quiet.example.com").unwrap());
        assert!(!store.idle_if_stale("quiet.example.com", cutoff).unwrap());

        assert!(!store.idle_if_stale("busy.example.com", cutoff).unwrap());
        assert!(!store.idle_get("busy.example.com").unwrap());
        assert!(!store.idle_if_stale("unknown.example.com", cutoff).unwrap());
    }

    #[test]
    fn test_concurrent_begin_end_returns_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.db");
        let setup = SqliteStorage::new(Database::open(&path).unwrap(), "routes").unwrap();
        setup.target_add("app.example.com", "http://10.0.0.1:3000").unwrap();

        // Each thread gets its own connection to the shared file
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = SqliteStorage::new(Database::open(&path).unwrap(), "routes").unwrap();
                    for _ in 0..100 {
                        store.request_begin("app.example.com").unwrap();
                        store.request_end("app.example.com").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(setup.activity("app.example.com").unwrap().unwrap().in_flight, 0);
    }

    #[test]
    fn test_file_database_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.db");

        let first = SqliteStorage::new(Database::open(&path).unwrap(), "routes").unwrap();
        first.target_add("app.example.com", "http://10.0.0.1:3000").unwrap();

        let second = SqliteStorage::new(Database::open(&path).unwrap(), "routes").unwrap();
        assert_eq!(
            second.target_list("app.example.com").unwrap(),
            vec!["http://10.0.0.1:3000"]
        );
    }

    #[test]
    fn test_cert_cache() {
        let cache = SqliteCertCache::new(Database::open_in_memory().unwrap(), "certs").unwrap();
        assert!(cache.get("app.example.com").unwrap().is_none());

        cache.put("app.example.com", b"first").unwrap();
        cache.put("app.example.com", b"second").unwrap();
        assert_eq!(cache.get("app.example.com").unwrap().unwrap(), b"second");

        cache.delete("app.example.com").unwrap();
        assert!(cache.get("app.example.com").unwrap().is_none());
    }
}
