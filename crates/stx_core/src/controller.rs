//! Manual transaction control over a context.
//!
//! These primitives are deliberately permissive: with no store bound, or no
//! transaction open, `commit` and `rollback` succeed without doing anything,
//! so callers need not know whether they run inside a transaction.

use crate::binder::{self, current, SuccessCallback, TransactionHandle};
use crate::context::Context;
use crate::deferred::dispatch;
use crate::error::{TxError, TxResult};
use stx_store::TxOptions;
use tracing::{debug, trace};

/// Begins a transaction and returns a context carrying it.
///
/// With no store bound, returns `ctx` unchanged. If `ctx` is already inside a
/// transaction the store opens a savepoint. The new context gets a fresh,
/// empty callback queue.
///
/// # Errors
///
/// Returns [`TxError::BeginFailed`] if the store cannot begin.
pub fn begin(ctx: &Context, options: &TxOptions) -> TxResult<Context> {
    let Some(store) = current(ctx) else {
        trace!("begin without a bound store is a no-op");
        return Ok(ctx.clone());
    };

    let tx = store.begin_tx(options).map_err(TxError::BeginFailed)?;
    debug!(
        nested = store.is_transactional(),
        isolation = %options.isolation,
        read_only = options.read_only,
        "transaction begun"
    );
    Ok(binder::attach(ctx, tx))
}

/// Commits the transaction carried by `ctx`.
///
/// Succeeds without effect when no transaction is active. On success the
/// callbacks queued on `ctx` run in registration order, or, if `ctx` was begun
/// inside another transaction, move to that transaction's queue.
///
/// # Errors
///
/// Returns [`TxError::CommitFailed`] if the store fails to commit. The
/// transaction and its queue are left as they were.
pub fn commit(ctx: &Context) -> TxResult<()> {
    if let Some(handle) = binder::handle(ctx) {
        let callbacks = commit_handle(&handle)?;
        dispatch(handle.parent(), callbacks);
    }
    Ok(())
}

/// Commits `handle` and closes its queue, returning the queued callbacks.
pub(crate) fn commit_handle(handle: &TransactionHandle) -> TxResult<Vec<SuccessCallback>> {
    if !handle.is_transactional() {
        return Ok(Vec::new());
    }
    handle.store().commit().map_err(TxError::CommitFailed)?;
    let callbacks = handle.mark_committed();
    debug!(callbacks = callbacks.len(), "transaction committed");
    Ok(callbacks)
}

/// Rolls back the transaction carried by `ctx`.
///
/// Succeeds without effect when no transaction is active. Callbacks queued
/// on `ctx` are dropped.
///
/// # Errors
///
/// Returns [`TxError::RollbackFailed`] if the store fails to roll back; the
/// queue is kept so the rollback can be retried.
pub fn rollback(ctx: &Context) -> TxResult<()> {
    match binder::handle(ctx) {
        Some(handle) if handle.is_transactional() => {
            handle
                .store()
                .rollback()
                .map_err(TxError::RollbackFailed)?;
            let discarded = handle.discard();
            debug!(discarded, "transaction rolled back");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Returns true if `ctx` carries a store that is inside a transaction.
#[must_use]
pub fn is_active(ctx: &Context) -> bool {
    current(ctx).is_some_and(|store| store.is_transactional())
}
