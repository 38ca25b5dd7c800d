//! Store capability trait definition.

use crate::error::{BoxError, RunError, StoreResult};
use crate::options::TxOptions;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Shared, type-erased store handle.
pub type StoreRef = Arc<dyn Store>;

/// Transaction body passed to [`Store::run_in_transaction`].
pub type TxFn<'a> = Box<dyn FnOnce(StoreRef) -> Result<(), BoxError> + 'a>;

/// Identity of a physical connection.
///
/// Two handles with the same connection id talk to the same connection. A
/// transaction handle is bound to a different connection than the root handle
/// it was begun from; savepoints share their parent's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// A transactional store.
///
/// Stores are **opaque** to the context container: it only begins, commits,
/// and rolls back through this trait and compares connection identities.
/// The record methods are the minimal read/write surface units of work use.
///
/// # Invariants
///
/// - `begin_tx` on a transactional handle opens a savepoint (or fails, if the
///   store has no savepoints)
/// - `commit`/`rollback` succeed at most once per transaction handle
/// - a handle's connection ids never change
/// - stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
pub trait Store: Send + Sync + fmt::Debug {
    /// Begins a transaction, or a savepoint when already inside one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot open the transaction.
    fn begin_tx(&self, options: &TxOptions) -> StoreResult<StoreRef>;

    /// Commits the transaction this handle is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not transactional, the transaction is
    /// already closed, or the store fails to persist it.
    fn commit(&self) -> StoreResult<()>;

    /// Rolls back the transaction this handle is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not transactional or the transaction
    /// is already closed.
    fn rollback(&self) -> StoreResult<()>;

    /// Connection this handle is bound to, if any.
    fn connection_id(&self) -> Option<ConnectionId>;

    /// Connection of the root (unscoped) handle this one derives from.
    fn root_connection_id(&self) -> Option<ConnectionId>;

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn delete(&self, table: &str, key: &str) -> StoreResult<()>;

    /// Counts the records visible in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn count(&self, table: &str) -> StoreResult<usize>;

    /// Returns true if this handle is inside a transaction.
    ///
    /// A handle is transactional iff its bound connection is present and
    /// differs from the root connection.
    fn is_transactional(&self) -> bool {
        match self.connection_id() {
            Some(bound) => self.root_connection_id() != Some(bound),
            None => false,
        }
    }

    /// Runs `f` inside a transaction.
    ///
    /// Begins a transaction (a savepoint when this handle is already
    /// transactional), hands it to `f`, and commits if `f` returns `Ok`.
    /// If `f` returns `Err` or the commit fails, the transaction is rolled
    /// back. If `f` panics, the transaction is rolled back and the panic
    /// resumes.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] naming the step that failed.
    fn run_in_transaction(&self, options: &TxOptions, f: TxFn<'_>) -> Result<(), RunError> {
        let tx = self.begin_tx(options).map_err(RunError::Begin)?;
        let body_tx = Arc::clone(&tx);

        match panic::catch_unwind(AssertUnwindSafe(move || f(body_tx))) {
            Ok(Ok(())) => match tx.commit() {
                Ok(()) => Ok(()),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback() {
                        warn!(error = %rollback_err, "rollback after failed commit failed");
                    }
                    Err(RunError::Commit(err))
                }
            },
            Ok(Err(err)) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback of aborted transaction failed");
                }
                Err(RunError::Aborted(err))
            }
            Err(payload) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback during panic failed");
                }
                panic::resume_unwind(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }

    #[test]
    fn connection_id_display() {
        let id = ConnectionId::new();
        assert!(id.to_string().starts_with("conn:"));
    }
}
