//! Error types for context-scoped transactions.

use std::any::Any;
use std::io;
use stx_store::{BoxError, StoreError};
use thiserror::Error;

/// Result type for transaction operations.
pub type TxResult<T> = Result<T, TxError>;

/// Errors that can occur in context-scoped transactions.
#[derive(Debug, Error)]
pub enum TxError {
    /// The context carries no store.
    #[error("no store bound to context")]
    NoStoreBound,

    /// The store failed to begin a transaction.
    #[error("failed to begin transaction: {0}")]
    BeginFailed(#[source] StoreError),

    /// The store failed to commit.
    #[error("failed to commit transaction: {0}")]
    CommitFailed(#[source] StoreError),

    /// The store failed to roll back.
    #[error("failed to roll back transaction: {0}")]
    RollbackFailed(#[source] StoreError),

    /// A panic escaped the protected region and was converted to an error.
    #[error("recovered from panic: {message}")]
    RecoveredFault {
        /// Panic payload rendered as text.
        message: String,
        /// The payload itself, when the panic carried an error value.
        #[source]
        source: Option<BoxError>,
    },

    /// A store operation inside a unit of work failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A unit of work asked for a rollback.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// Any other error returned by a unit of work.
    #[error(transparent)]
    Application(BoxError),
}

impl TxError {
    /// Creates a transaction aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Creates a recovered fault error from a panic payload.
    ///
    /// Text payloads (`&str`, `String`) become the message. Error payloads
    /// (`TxError`, `StoreError`, `BoxError`, `io::Error`) also become the
    /// message and are kept as the error source.
    pub fn recovered(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<&'static str>() {
            Ok(message) => return Self::fault((*message).to_string(), None),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Self::fault(*message, None),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<TxError>() {
            Ok(err) => return Self::fault(err.to_string(), Some(err as BoxError)),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<StoreError>() {
            Ok(err) => return Self::fault(err.to_string(), Some(err as BoxError)),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<BoxError>() {
            Ok(err) => return Self::fault(err.to_string(), Some(*err)),
            Err(payload) => payload,
        };
        match payload.downcast::<io::Error>() {
            Ok(err) => Self::fault(err.to_string(), Some(err as BoxError)),
            Err(_) => Self::fault("unknown panic payload".to_string(), None),
        }
    }

    fn fault(message: String, source: Option<BoxError>) -> Self {
        Self::RecoveredFault { message, source }
    }

    /// Wraps an arbitrary caller error.
    pub fn application(err: impl Into<BoxError>) -> Self {
        Self::Application(err.into())
    }

    /// Recovers a `TxError` that crossed a type-erased store boundary.
    pub(crate) fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<TxError>() {
            Ok(err) => *err,
            Err(err) => match err.downcast::<StoreError>() {
                Ok(err) => Self::Store(*err),
                Err(err) => Self::Application(err),
            },
        }
    }

    /// Returns true if this error came from a recovered panic.
    #[must_use]
    pub fn is_recovered_fault(&self) -> bool {
        matches!(self, Self::RecoveredFault { .. })
    }
}
