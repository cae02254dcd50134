//! Run-scoped "have I seen this id?" stores.
//!
//! Each resource owns one store for the duration of a run. The on-disk
//! implementation keeps a redb database in a fresh temporary directory that
//! disappears when the store is closed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redb::{Database, Durability, ReadableTable, TableDefinition};
use tempfile::TempDir;
use thiserror::Error;

const SEEN: TableDefinition<&str, ()> = TableDefinition::new("seen");

const DATABASE_FILE: &str = "dedup.redb";

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup storage error: {0}")]
    Storage(String),

    #[error("dedup store is closed")]
    Closed,
}

macro_rules! storage_err {
    ($($t:ty),+ $(,)?) => {
        $(impl From<$t> for DedupError {
            fn from(e: $t) -> Self {
                Self::Storage(e.to_string())
            }
        })+
    };
}

storage_err!(
    std::io::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Set membership with an atomic check-and-insert.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Record `key` and report whether it had been recorded before.
    ///
    /// Among concurrent first-time callers for the same key exactly one
    /// observes `false`.
    async fn seen_before(&self, key: &str) -> Result<bool, DedupError>;

    /// Release the store. Further calls fail with [`DedupError::Closed`].
    fn close(&self);
}

struct OpenDatabase {
    db: Arc<Database>,
    // Held for its drop, which removes the directory.
    _dir: TempDir,
}

/// A dedup store backed by a redb file in a temporary directory.
pub struct RedbDedupStore {
    inner: Mutex<Option<OpenDatabase>>,
}

impl RedbDedupStore {
    /// Create a store in a fresh temporary directory.
    pub fn open() -> Result<Self, DedupError> {
        let dir = tempfile::Builder::new().prefix("tributary-dedup-").tempdir()?;
        let db = Database::create(dir.path().join(DATABASE_FILE))?;
        tracing::debug!(path = %dir.path().display(), "opened dedup store");

        Ok(Self {
            inner: Mutex::new(Some(OpenDatabase {
                db: Arc::new(db),
                _dir: dir,
            })),
        })
    }

    fn database(&self) -> Result<Arc<Database>, DedupError> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| DedupError::Storage("dedup store lock poisoned".to_string()))?;
        guard
            .as_ref()
            .map(|open| Arc::clone(&open.db))
            .ok_or(DedupError::Closed)
    }
}

fn check_and_insert(db: &Database, key: &str) -> Result<bool, DedupError> {
    let mut txn = db.begin_write()?;
    // The database is deleted on close, so commits skip the fsync.
    txn.set_durability(Durability::None);
    let seen = {
        let mut table = txn.open_table(SEEN)?;
        let seen = table.get(key)?.is_some();
        if !seen {
            table.insert(key, ())?;
        }
        seen
    };
    txn.commit()?;
    Ok(seen)
}

#[async_trait]
impl DedupStore for RedbDedupStore {
    async fn seen_before(&self, key: &str) -> Result<bool, DedupError> {
        let db = self.database()?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || check_and_insert(&db, &key))
            .await
            .map_err(|e| DedupError::Storage(e.to_string()))?
    }

    fn close(&self) {
        if let Ok(mut guard) = self.inner.lock()
            && guard.take().is_some()
        {
            tracing::debug!("closed dedup store");
        }
    }
}

/// An in-memory dedup store.
pub struct MemoryDedupStore {
    keys: Mutex<Option<HashSet<String>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(Some(HashSet::new())),
        }
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn seen_before(&self, key: &str) -> Result<bool, DedupError> {
        let mut guard = self
            .keys
            .lock()
            .map_err(|_| DedupError::Storage("dedup store lock poisoned".to_string()))?;
        let keys = guard.as_mut().ok_or(DedupError::Closed)?;
        Ok(!keys.insert(key.to_string()))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.keys.lock() {
            guard.take();
        }
    }
}
