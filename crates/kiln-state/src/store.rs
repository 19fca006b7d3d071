//! AuditStore — redb-backed persistence for audit records.
//!
//! Supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::AuditRecord;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::AUDIT;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe audit store backed by redb.
#[derive(Clone)]
pub struct AuditStore {
    db: Arc<Database>,
    /// Tie-breaker for records stamped in the same nanosecond.
    seq: Arc<AtomicU64>,
}

impl AuditStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "audit store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory audit store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let store = Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn record_key(&self, record: &AuditRecord) -> String {
        let nanos = record
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:020}:{seq:010}")
    }

    /// Append an audit record.
    pub fn append(&self, record: &AuditRecord) -> StateResult<()> {
        let key = self.record_key(record);
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, user = %record.user, "audit record stored");
        Ok(())
    }

    /// Newest records first, at most `limit`.
    pub fn list_recent(&self, limit: usize) -> StateResult<Vec<AuditRecord>> {
        self.scan_newest(limit, |_| true)
    }

    /// Newest records for one user, at most `limit`.
    pub fn list_for_user(&self, user: &str, limit: usize) -> StateResult<Vec<AuditRecord>> {
        self.scan_newest(limit, |record| record.user == user)
    }

    /// Total number of stored records.
    pub fn count(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    fn scan_newest(
        &self,
        limit: usize,
        keep: impl Fn(&AuditRecord) -> bool,
    ) -> StateResult<Vec<AuditRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: AuditRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kiln_core::Severity;

    fn record(user: &str, message: &str, offset_secs: i64) -> AuditRecord {
        let mut record = AuditRecord::new(Some("user-test"), user, message, Severity::Error);
        record.timestamp = Utc::now() + Duration::seconds(offset_secs);
        record
    }

    #[test]
    fn append_and_list_newest_first() {
        let store = AuditStore::open_in_memory().unwrap();
        store.append(&record("alice", "first", 0)).unwrap();
        store.append(&record("alice", "second", 1)).unwrap();
        store.append(&record("alice", "third", 2)).unwrap();

        let recent = store.list_recent(10).unwrap();
        let messages: Vec<&str> = recent.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["third", "second", "first"]);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn list_respects_limit() {
        let store = AuditStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.append(&record("bob", &format!("m{i}"), i)).unwrap();
        }
        let recent = store.list_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "m4");
    }

    #[test]
    fn same_timestamp_does_not_overwrite() {
        let store = AuditStore::open_in_memory().unwrap();
        let r = record("carol", "dup", 0);
        store.append(&r).unwrap();
        store.append(&r).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn filter_by_user() {
        let store = AuditStore::open_in_memory().unwrap();
        store.append(&record("alice", "a1", 0)).unwrap();
        store.append(&record("bob", "b1", 1)).unwrap();
        store.append(&record("alice", "a2", 2)).unwrap();

        let alice = store.list_for_user("alice", 10).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|r| r.user == "alice"));
        assert!(store.list_for_user("nobody", 10).unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("audit.redb");

        {
            let store = AuditStore::open(&db_path).unwrap();
            store.append(&record("dave", "kept", 0)).unwrap();
        }

        let store = AuditStore::open(&db_path).unwrap();
        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "kept");
    }

    #[test]
    fn empty_store_operations() {
        let store = AuditStore::open_in_memory().unwrap();
        assert!(store.list_recent(10).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }
}
