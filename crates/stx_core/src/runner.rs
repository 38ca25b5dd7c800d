//! Closure-scoped transactions.

use crate::binder::{self, current, TransactionHandle};
use crate::context::Context;
use crate::deferred::dispatch;
use crate::error::{TxError, TxResult};
use std::sync::Arc;
use stx_store::{BoxError, RunError, StoreRef, TxOptions};
use tracing::debug;

/// Runs `f` inside a transaction with default options.
///
/// See [`run_in_transaction_with`].
///
/// # Errors
///
/// Returns the error from `f`, or a store failure.
pub fn run_in_transaction<T, F>(ctx: &Context, f: F) -> TxResult<T>
where
    F: FnOnce(&Context) -> TxResult<T>,
{
    run_in_transaction_with(ctx, &TxOptions::default(), f)
}

/// Runs `f` inside a transaction.
///
/// `f` receives a context bound to the transaction. If `f` returns `Ok`, the
/// transaction is committed; if it returns `Err`, the transaction is rolled
/// back and the error returned unchanged. A panic in `f` rolls back and keeps
/// unwinding.
///
/// Callbacks registered with [`crate::on_success`] inside `f` run after the
/// commit succeeds, in registration order. When `ctx` is itself inside a
/// transaction, the work runs in a savepoint and its callbacks are handed to
/// the enclosing transaction, firing only when that one commits.
///
/// # Errors
///
/// - [`TxError::NoStoreBound`] if `ctx` carries no store
/// - [`TxError::BeginFailed`] / [`TxError::CommitFailed`] on store failures
/// - the error returned by `f`
pub fn run_in_transaction_with<T, F>(ctx: &Context, options: &TxOptions, f: F) -> TxResult<T>
where
    F: FnOnce(&Context) -> TxResult<T>,
{
    let store = current(ctx).ok_or(TxError::NoStoreBound)?;

    let mut output = None;
    let mut tx_handle: Option<Arc<TransactionHandle>> = None;
    let result = store.run_in_transaction(
        options,
        Box::new(|tx: StoreRef| -> Result<(), BoxError> {
            let tx_ctx = binder::attach(ctx, tx);
            tx_handle = binder::handle(&tx_ctx);
            output = Some(f(&tx_ctx)?);
            Ok(())
        }),
    );

    match result {
        Ok(()) => {}
        Err(RunError::Begin(err)) => return Err(TxError::BeginFailed(err)),
        Err(RunError::Commit(err)) => {
            let discarded = tx_handle.map_or(0, |handle| handle.discard());
            debug!(error = %err, discarded, "commit failed");
            return Err(TxError::CommitFailed(err));
        }
        Err(RunError::Aborted(err)) => {
            if let Some(handle) = tx_handle {
                handle.discard();
            }
            return Err(TxError::from_boxed(err));
        }
    }

    if let Some(handle) = tx_handle {
        dispatch(handle.parent(), handle.mark_committed());
    }
    output.ok_or_else(|| TxError::aborted("store committed without running the unit of work"))
}
