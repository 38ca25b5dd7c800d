//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A type-erased error raised by a transaction body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transaction was already committed or rolled back.
    #[error("transaction already committed or rolled back")]
    TransactionClosed,

    /// A write was attempted inside a read-only transaction.
    #[error("write rejected: transaction is read-only")]
    ReadOnly,

    /// Commit or rollback was called on a handle with no open transaction.
    #[error("handle is not bound to a transaction")]
    NotTransactional,

    /// A failure injected for testing.
    #[error("injected failure: {message}")]
    Injected {
        /// Description of the injected failure.
        message: String,
    },

    /// Backend-specific failure.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates an injected failure.
    pub fn injected(message: impl Into<String>) -> Self {
        Self::Injected {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Errors from [`crate::Store::run_in_transaction`].
///
/// The variants say which step failed, so callers can tell a failed begin
/// from a failed commit from a body that asked for a rollback.
#[derive(Debug, Error)]
pub enum RunError {
    /// The transaction could not be started.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] StoreError),

    /// The body succeeded but the commit step failed.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] StoreError),

    /// The body returned an error; the transaction was rolled back.
    #[error("transaction aborted: {0}")]
    Aborted(#[source] BoxError),
}
