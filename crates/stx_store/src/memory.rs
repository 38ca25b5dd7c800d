//! In-memory store for testing.

use crate::error::{StoreError, StoreResult};
use crate::options::TxOptions;
use crate::store::{ConnectionId, Store, StoreRef};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// (table, key)
type RecordKey = (String, String);

/// Snapshot of [`MemoryStore`] transaction counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Top-level transactions begun.
    pub begins: u64,
    /// Top-level transactions committed.
    pub commits: u64,
    /// Top-level transactions rolled back.
    pub rollbacks: u64,
    /// Savepoints released into their parent.
    pub savepoint_releases: u64,
    /// Savepoints rolled back.
    pub savepoint_rollbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    savepoint_releases: AtomicU64,
    savepoint_rollbacks: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            savepoint_releases: self.savepoint_releases.load(Ordering::Relaxed),
            savepoint_rollbacks: self.savepoint_rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the root handle and every transaction begun from it.
#[derive(Debug)]
struct Shared {
    root: ConnectionId,
    committed: RwLock<BTreeMap<RecordKey, Vec<u8>>>,
    counters: Counters,
    fail_next_commit: Mutex<Option<String>>,
    fail_next_rollback: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeStatus {
    Active,
    Committed,
    RolledBack,
}

/// Buffered writes of one transaction or savepoint. `None` marks a delete.
#[derive(Debug)]
struct Frame {
    writes: BTreeMap<RecordKey, Option<Vec<u8>>>,
    status: ScopeStatus,
}

#[derive(Debug)]
struct TxScope {
    frame: Mutex<Frame>,
    parent: Option<Arc<TxScope>>,
    connection: ConnectionId,
    read_only: bool,
    depth: usize,
}

impl TxScope {
    fn ensure_active(&self) -> StoreResult<()> {
        match self.frame.lock().status {
            ScopeStatus::Active => Ok(()),
            _ => Err(StoreError::TransactionClosed),
        }
    }

    /// Innermost scope first.
    fn chain(self: &Arc<Self>) -> Vec<Arc<TxScope>> {
        let mut chain = vec![Arc::clone(self)];
        let mut cur = self.parent.clone();
        while let Some(scope) = cur {
            cur = scope.parent.clone();
            chain.push(scope);
        }
        chain
    }
}

/// An in-memory transactional store.
///
/// Records are byte values addressed by `(table, key)`. The root handle
/// writes straight to the committed state. Transactions buffer their writes
/// and publish them on commit; beginning a transaction on a transactional
/// handle opens a savepoint that shares its parent's connection and releases
/// into the parent on commit.
///
/// Cloning a `MemoryStore` yields another handle to the same data.
///
/// # Thread Safety
///
/// Handles are `Send + Sync` and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use stx_store::{MemoryStore, Store, TxOptions};
///
/// let store = MemoryStore::new();
/// let tx = store.begin_tx(&TxOptions::default()).unwrap();
/// let savepoint = tx.begin_tx(&TxOptions::default()).unwrap();
/// savepoint.put("t", "k", vec![1]).unwrap();
/// savepoint.commit().unwrap();
/// tx.rollback().unwrap();
/// assert_eq!(store.get("t", "k").unwrap(), None);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    scope: Option<Arc<TxScope>>,
}

impl MemoryStore {
    /// Creates a new empty store and returns its root handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                root: ConnectionId::new(),
                committed: RwLock::new(BTreeMap::new()),
                counters: Counters::default(),
                fail_next_commit: Mutex::new(None),
                fail_next_rollback: Mutex::new(None),
            }),
            scope: None,
        }
    }

    /// Wraps this handle in a [`StoreRef`].
    #[must_use]
    pub fn into_ref(self) -> StoreRef {
        Arc::new(self)
    }

    /// Returns the transaction counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.shared.counters.snapshot()
    }

    /// Savepoint nesting depth: 0 for the root handle, 1 for a transaction.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scope.as_ref().map_or(0, |scope| scope.depth + 1)
    }

    /// Makes the next commit on any handle of this store fail.
    ///
    /// The failing transaction stays open so it can still be rolled back.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        *self.shared.fail_next_commit.lock() = Some(message.into());
    }

    /// Makes the next rollback on any handle of this store fail.
    pub fn fail_next_rollback(&self, message: impl Into<String>) {
        *self.shared.fail_next_rollback.lock() = Some(message.into());
    }

    /// Returns a copy of the committed records of a table.
    #[must_use]
    pub fn committed(&self, table: &str) -> BTreeMap<String, Vec<u8>> {
        self.shared
            .committed
            .read()
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect()
    }

    fn write(&self, table: &str, key: &str, value: Option<Vec<u8>>) -> StoreResult<()> {
        let record_key = (table.to_string(), key.to_string());
        match &self.scope {
            Some(scope) => {
                if scope.read_only {
                    return Err(StoreError::ReadOnly);
                }
                let mut frame = scope.frame.lock();
                if frame.status != ScopeStatus::Active {
                    return Err(StoreError::TransactionClosed);
                }
                frame.writes.insert(record_key, value);
            }
            None => {
                let mut committed = self.shared.committed.write();
                match value {
                    Some(value) => {
                        committed.insert(record_key, value);
                    }
                    None => {
                        committed.remove(&record_key);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn begin_tx(&self, options: &TxOptions) -> StoreResult<StoreRef> {
        let scope = match &self.scope {
            Some(parent) => {
                parent.ensure_active()?;
                trace!(depth = parent.depth + 1, "opening savepoint");
                TxScope {
                    frame: Mutex::new(Frame {
                        writes: BTreeMap::new(),
                        status: ScopeStatus::Active,
                    }),
                    parent: Some(Arc::clone(parent)),
                    connection: parent.connection,
                    read_only: parent.read_only || options.read_only,
                    depth: parent.depth + 1,
                }
            }
            None => {
                let connection = ConnectionId::new();
                trace!(%connection, isolation = %options.isolation, "beginning transaction");
                self.shared.counters.begins.fetch_add(1, Ordering::Relaxed);
                TxScope {
                    frame: Mutex::new(Frame {
                        writes: BTreeMap::new(),
                        status: ScopeStatus::Active,
                    }),
                    parent: None,
                    connection,
                    read_only: options.read_only,
                    depth: 0,
                }
            }
        };

        Ok(Arc::new(Self {
            shared: Arc::clone(&self.shared),
            scope: Some(Arc::new(scope)),
        }))
    }

    fn commit(&self) -> StoreResult<()> {
        let scope = self.scope.as_ref().ok_or(StoreError::NotTransactional)?;
        let mut frame = scope.frame.lock();
        if frame.status != ScopeStatus::Active {
            return Err(StoreError::TransactionClosed);
        }
        if let Some(message) = self.shared.fail_next_commit.lock().take() {
            return Err(StoreError::Injected { message });
        }

        match &scope.parent {
            Some(parent) => {
                let mut parent_frame = parent.frame.lock();
                if parent_frame.status != ScopeStatus::Active {
                    return Err(StoreError::TransactionClosed);
                }
                parent_frame.writes.append(&mut frame.writes);
                self.shared
                    .counters
                    .savepoint_releases
                    .fetch_add(1, Ordering::Relaxed);
                trace!(depth = scope.depth, "released savepoint");
            }
            None => {
                let writes = std::mem::take(&mut frame.writes);
                let mut committed = self.shared.committed.write();
                for (key, value) in writes {
                    match value {
                        Some(value) => {
                            committed.insert(key, value);
                        }
                        None => {
                            committed.remove(&key);
                        }
                    }
                }
                self.shared.counters.commits.fetch_add(1, Ordering::Relaxed);
                trace!(connection = %scope.connection, "committed transaction");
            }
        }

        frame.status = ScopeStatus::Committed;
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        let scope = self.scope.as_ref().ok_or(StoreError::NotTransactional)?;
        let mut frame = scope.frame.lock();
        if frame.status != ScopeStatus::Active {
            return Err(StoreError::TransactionClosed);
        }
        if let Some(message) = self.shared.fail_next_rollback.lock().take() {
            return Err(StoreError::Injected { message });
        }

        frame.writes.clear();
        frame.status = ScopeStatus::RolledBack;
        let counter = if scope.parent.is_some() {
            &self.shared.counters.savepoint_rollbacks
        } else {
            &self.shared.counters.rollbacks
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(depth = scope.depth, "rolled back");
        Ok(())
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        Some(
            self.scope
                .as_ref()
                .map_or(self.shared.root, |scope| scope.connection),
        )
    }

    fn root_connection_id(&self) -> Option<ConnectionId> {
        Some(self.shared.root)
    }

    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let record_key = (table.to_string(), key.to_string());
        if let Some(scope) = &self.scope {
            scope.ensure_active()?;
            for scope in scope.chain() {
                if let Some(write) = scope.frame.lock().writes.get(&record_key) {
                    return Ok(write.clone());
                }
            }
        }
        Ok(self.shared.committed.read().get(&record_key).cloned())
    }

    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.write(table, key, Some(value))
    }

    fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        self.write(table, key, None)
    }

    fn count(&self, table: &str) -> StoreResult<usize> {
        let mut visible: BTreeMap<String, bool> = self
            .committed(table)
            .into_keys()
            .map(|key| (key, true))
            .collect();

        if let Some(scope) = &self.scope {
            scope.ensure_active()?;
            for scope in scope.chain().into_iter().rev() {
                let frame = scope.frame.lock();
                for ((t, k), value) in &frame.writes {
                    if t == table {
                        visible.insert(k.clone(), value.is_some());
                    }
                }
            }
        }

        Ok(visible.values().filter(|present| **present).count())
    }
}
