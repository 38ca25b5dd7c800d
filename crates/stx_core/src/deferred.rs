//! Guard-scoped transactions and the success callback queue.
//!
//! [`begin_deferred`] starts a transaction and hands back a [`Cleanup`] guard
//! instead of taking a closure, so one transaction can span several
//! statements of the caller's own body:
//!
//! ```rust
//! use stx_core::{attach, begin_deferred, current, Context, TxError, TxOptions, TxResult};
//! use stx_store::MemoryStore;
//!
//! fn insert_user(ctx: &Context) -> TxResult<()> {
//!     let store = current(ctx).ok_or(TxError::NoStoreBound)?;
//!     store.put("users", "alice", b"{}".to_vec())?;
//!     Ok(())
//! }
//!
//! fn create_user(ctx: &Context) -> TxResult<()> {
//!     let (tx_ctx, cleanup) = begin_deferred(ctx, &TxOptions::default())?;
//!     let result = insert_user(&tx_ctx);
//!     cleanup.finish(result)
//! }
//!
//! let ctx = attach(&Context::background(), MemoryStore::new().into_ref());
//! create_user(&ctx).unwrap();
//! ```
//!
//! Dropping the guard without finishing it rolls back, so an early return or
//! a panic unwinding through the scope never leaves the transaction open.
//! [`with_deferred`] also converts such a panic into
//! [`TxError::RecoveredFault`].

use crate::binder::{self, SuccessCallback, TransactionHandle};
use crate::context::Context;
use crate::controller;
use crate::error::{TxError, TxResult};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use stx_store::TxOptions;
use tracing::{error, trace, warn};

/// Lifecycle of one deferred transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// No store was bound, so nothing was begun.
    Idle,
    /// Transaction open.
    Active,
    /// Committed; callbacks fired.
    Committed,
    /// Rolled back after an error, a failed commit, or an unfinished guard.
    RolledBack,
    /// Rolled back while a panic was unwinding.
    PanicRolledBack,
}

impl ScopeState {
    /// Returns true for every state except `Active`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Active
    }
}

/// Finalizer for a transaction started by [`begin_deferred`].
///
/// Call [`Cleanup::finish`] (or [`Cleanup::recover`]) exactly once with the
/// outcome of the protected region. If the guard is dropped while still
/// active, the transaction is rolled back and its callbacks discarded.
#[must_use = "dropping the cleanup guard rolls the transaction back"]
#[derive(Debug)]
pub struct Cleanup {
    ctx: Context,
    state: ScopeState,
}

impl Cleanup {
    /// Returns the transactional context this guard finalizes.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Returns the scope state.
    #[must_use]
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Completes the scope with the result of the protected region.
    ///
    /// - `Err`: rolls back and returns the error unchanged; a rollback failure
    ///   is logged and does not replace it
    /// - `Ok`: commits, then runs the queued callbacks in registration order
    ///
    /// A panic raised by a callback propagates to the caller; the transaction
    /// is already committed at that point.
    ///
    /// # Errors
    ///
    /// Returns the region's error, or [`TxError::CommitFailed`].
    pub fn finish<T>(mut self, result: TxResult<T>) -> TxResult<T> {
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                self.abort(ScopeState::RolledBack);
                return Err(err);
            }
        };

        if self.state == ScopeState::Idle {
            return Ok(value);
        }
        let Some(handle) = binder::handle(&self.ctx) else {
            self.state = ScopeState::Idle;
            return Ok(value);
        };

        match controller::commit_handle(&handle) {
            Ok(callbacks) => {
                self.state = ScopeState::Committed;
                dispatch(handle.parent(), callbacks);
                Ok(value)
            }
            Err(err) => {
                self.abort(ScopeState::RolledBack);
                Err(err)
            }
        }
    }

    /// Completes the scope with an outcome captured by
    /// [`std::panic::catch_unwind`].
    ///
    /// A captured panic rolls back and becomes [`TxError::RecoveredFault`];
    /// the panic is absorbed, not resumed. Any other outcome is handled by
    /// [`Cleanup::finish`].
    ///
    /// # Errors
    ///
    /// Returns [`TxError::RecoveredFault`], the region's error, or
    /// [`TxError::CommitFailed`].
    pub fn recover<T>(mut self, outcome: thread::Result<TxResult<T>>) -> TxResult<T> {
        match outcome {
            Ok(result) => self.finish(result),
            Err(payload) => {
                let err = TxError::recovered(payload);
                error!(error = %err, "panic in transaction scope, rolling back");
                self.abort(ScopeState::PanicRolledBack);
                Err(err)
            }
        }
    }

    fn abort(&mut self, state: ScopeState) {
        if self.state == ScopeState::Active {
            if let Err(err) = controller::rollback(&self.ctx) {
                warn!(error = %err, "rollback failed, keeping original outcome");
            }
            if let Some(handle) = binder::handle(&self.ctx) {
                let discarded = handle.discard();
                if discarded > 0 {
                    trace!(discarded, "discarded success callbacks");
                }
            }
            self.state = state;
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.state == ScopeState::Active {
            let state = if thread::panicking() {
                ScopeState::PanicRolledBack
            } else {
                warn!("cleanup guard dropped without finish, rolling back");
                ScopeState::RolledBack
            };
            self.abort(state);
        }
    }
}

/// Begins a transaction and returns its context with a cleanup guard.
///
/// With no store bound the returned guard is [`ScopeState::Idle`]: finishing
/// it does nothing and [`on_success`] callbacks run immediately.
///
/// # Errors
///
/// Returns [`TxError::BeginFailed`] if the store cannot begin.
pub fn begin_deferred(ctx: &Context, options: &TxOptions) -> TxResult<(Context, Cleanup)> {
    let tx_ctx = controller::begin(ctx, options)?;
    let state = if binder::current(ctx).is_some() {
        ScopeState::Active
    } else {
        ScopeState::Idle
    };

    let cleanup = Cleanup {
        ctx: tx_ctx.clone(),
        state,
    };
    Ok((tx_ctx, cleanup))
}

/// Runs `f` in a deferred transaction scope, converting panics to errors.
///
/// Equivalent to [`begin_deferred`], running `f` under
/// [`std::panic::catch_unwind`], and passing the outcome to
/// [`Cleanup::recover`].
///
/// # Errors
///
/// Returns [`TxError::RecoveredFault`] if `f` panicked, otherwise as
/// [`Cleanup::finish`].
pub fn with_deferred<T, F>(ctx: &Context, options: &TxOptions, f: F) -> TxResult<T>
where
    F: FnOnce(&Context) -> TxResult<T>,
{
    let (tx_ctx, cleanup) = begin_deferred(ctx, options)?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&tx_ctx)));
    cleanup.recover(outcome)
}

/// Registers `callback` to run once the transaction in `ctx` commits.
///
/// If `ctx` has no active transaction the callback runs immediately on the
/// calling thread. Otherwise it is queued; concurrent registrations are safe
/// and run in the order the queue lock was taken.
///
/// Registering through a context whose transaction has already settled does
/// not queue: after a commit the callback is handled as if it had been
/// queued before the commit, after a rollback it is dropped.
pub fn on_success<F>(ctx: &Context, callback: F)
where
    F: FnOnce() + Send + 'static,
{
    match binder::handle(ctx) {
        Some(handle) if handle.is_transactional() => {
            if let Some(late) = handle.enqueue(Box::new(callback)) {
                dispatch(handle.parent(), vec![late]);
            }
        }
        _ => callback(),
    }
}

/// Hands callbacks of a committed scope to whoever should run them.
///
/// If `outer` is itself inside a transaction, the scope was a savepoint and
/// the callbacks wait for the enclosing commit. Otherwise they run now.
pub(crate) fn dispatch(outer: Option<&TransactionHandle>, callbacks: Vec<SuccessCallback>) {
    if callbacks.is_empty() {
        return;
    }

    match outer {
        Some(outer) if outer.is_transactional() => {
            trace!(count = callbacks.len(), "deferring callbacks to enclosing transaction");
            let late: Vec<_> = callbacks
                .into_iter()
                .filter_map(|callback| outer.enqueue(callback))
                .collect();
            dispatch(outer.parent(), late);
        }
        _ => {
            for callback in callbacks {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{attach, current};
    use crate::controller::is_active;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use stx_store::{MemoryStore, Store, StoreError};

    fn setup() -> (MemoryStore, Context) {
        let store = MemoryStore::new();
        let ctx = attach(&Context::background(), store.clone().into_ref());
        (store, ctx)
    }

    fn flag() -> (Arc<AtomicBool>, impl FnOnce() + Send + 'static) {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        (flag, move || setter.store(true, Ordering::SeqCst))
    }

    #[test]
    fn finish_ok_commits_and_fires() {
        let (store, ctx) = setup();
        let (fired, callback) = flag();

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        assert_eq!(cleanup.state(), ScopeState::Active);
        current(&tx_ctx).unwrap().put("users", "x", vec![1]).unwrap();
        on_success(&tx_ctx, callback);
        assert!(!fired.load(Ordering::SeqCst));

        cleanup.finish(Ok(())).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(store.get("users", "x").unwrap().is_some());
        assert_eq!(store.stats().commits, 1);
    }

    #[test]
    fn finish_err_rolls_back_and_keeps_error() {
        let (store, ctx) = setup();
        let (fired, callback) = flag();

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        current(&tx_ctx).unwrap().put("users", "x", vec![1]).unwrap();
        on_success(&tx_ctx, callback);

        let result: TxResult<()> = cleanup.finish(Err(TxError::aborted("business rule")));
        assert!(matches!(result, Err(TxError::Aborted { .. })));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(store.get("users", "x").unwrap().is_none());
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().commits, 0);
    }

    #[test]
    fn rollback_failure_does_not_replace_error() {
        let (store, ctx) = setup();
        let (_tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        store.fail_next_rollback("connection reset");

        let result: TxResult<()> = cleanup.finish(Err(TxError::aborted("original")));
        assert!(matches!(result, Err(TxError::Aborted { ref reason }) if reason == "original"));
    }

    #[test]
    fn commit_failure_is_reported_and_rolled_back() {
        let (store, ctx) = setup();
        let (fired, callback) = flag();

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        current(&tx_ctx).unwrap().put("users", "x", vec![1]).unwrap();
        on_success(&tx_ctx, callback);
        store.fail_next_commit("disk full");

        let result = cleanup.finish(Ok(()));
        assert!(matches!(result, Err(TxError::CommitFailed(StoreError::Injected { .. }))));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(store.get("users", "x").unwrap().is_none());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn recover_converts_panic() {
        let (store, ctx) = setup();
        let (fired, callback) = flag();

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> TxResult<()> {
            current(&tx_ctx).unwrap().put("users", "x", vec![1])?;
            on_success(&tx_ctx, callback);
            panic!("boom");
        }));

        let err = cleanup.recover(outcome).unwrap_err();
        assert!(matches!(err, TxError::RecoveredFault { ref message, .. } if message == "boom"));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(store.get("users", "x").unwrap().is_none());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn dropped_guard_rolls_back() {
        let (store, ctx) = setup();
        let (fired, callback) = flag();

        {
            let (tx_ctx, _cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
            current(&tx_ctx).unwrap().put("users", "x", vec![1]).unwrap();
            on_success(&tx_ctx, callback);
        }

        assert!(!fired.load(Ordering::SeqCst));
        assert!(store.get("users", "x").unwrap().is_none());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn guard_rolls_back_during_uncaught_unwind() {
        let (store, ctx) = setup();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let (tx_ctx, _cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
            current(&tx_ctx).unwrap().put("users", "x", vec![1]).unwrap();
            panic!("escaping");
        }));

        assert!(result.is_err());
        assert!(store.get("users", "x").unwrap().is_none());
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().commits, 0);
    }

    #[test]
    fn idle_scope_without_store() {
        let ctx = Context::background();
        let (fired, callback) = flag();

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        assert_eq!(cleanup.state(), ScopeState::Idle);
        assert!(cleanup.state().is_terminal());
        assert!(!is_active(&tx_ctx));

        on_success(&tx_ctx, callback);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(cleanup.finish(Ok(5)).unwrap(), 5);
    }

    #[test]
    fn with_deferred_commits() {
        let (store, ctx) = setup();
        let (fired, callback) = flag();

        with_deferred(&ctx, &TxOptions::default(), |tx_ctx| {
            current(tx_ctx).unwrap().put("users", "x", vec![1])?;
            on_success(tx_ctx, callback);
            Ok(())
        })
        .unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert!(store.get("users", "x").unwrap().is_some());
    }

    #[test]
    fn with_deferred_absorbs_panic() {
        let (store, ctx) = setup();
        let result: TxResult<()> = with_deferred(&ctx, &TxOptions::default(), |tx_ctx| {
            current(tx_ctx).unwrap().put("users", "x", vec![1])?;
            panic!("{}", String::from("formatted boom"));
        });

        let err = result.unwrap_err();
        assert!(err.is_recovered_fault());
        assert_eq!(err.to_string(), "recovered from panic: formatted boom");
        assert!(store.get("users", "x").unwrap().is_none());
    }

    #[test]
    fn callback_panic_escapes_after_commit() {
        let (store, ctx) = setup();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
            current(&tx_ctx).unwrap().put("users", "x", vec![1]).unwrap();
            on_success(&tx_ctx, || panic!("callback failed"));
            cleanup.finish(Ok(()))
        }));

        assert!(result.is_err());
        assert!(store.get("users", "x").unwrap().is_some());
        assert_eq!(store.stats().commits, 1);
        assert_eq!(store.stats().rollbacks, 0);
    }

    #[test]
    fn on_success_without_transaction_runs_immediately() {
        let (fired, callback) = flag();
        on_success(&Context::background(), callback);
        assert!(fired.load(Ordering::SeqCst));

        let (_store, ctx) = setup();
        let (fired, callback) = flag();
        on_success(&ctx, callback);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_deferred_callbacks_wait_for_outer() {
        let (_store, ctx) = setup();
        let (fired, callback) = flag();

        let (outer_ctx, outer) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        let (inner_ctx, inner) = begin_deferred(&outer_ctx, &TxOptions::default()).unwrap();
        on_success(&inner_ctx, callback);

        inner.finish(Ok(())).unwrap();
        assert!(!fired.load(Ordering::SeqCst));

        outer.finish(Ok(())).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_registration() {
        let (_store, ctx) = setup();
        let counter = Arc::new(AtomicUsize::new(0));

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        let threads: Vec<_> = (0..10)
            .map(|_| {
                let tx_ctx = tx_ctx.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    on_success(&tx_ctx, move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        cleanup.finish(Ok(())).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn callback_runs_once_even_if_dispatched_again() {
        let (_store, ctx) = setup();
        let counter = Arc::new(AtomicUsize::new(0));

        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        let c = Arc::clone(&counter);
        on_success(&tx_ctx, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        cleanup.finish(Ok(())).unwrap();

        // The queue was taken by the commit.
        let handle = binder::handle(&tx_ctx).unwrap();
        dispatch(handle.parent(), handle.mark_committed());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_after_finish_runs_immediately() {
        let (_store, ctx) = setup();
        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        cleanup.finish(Ok(())).unwrap();

        let (fired, callback) = flag();
        on_success(&tx_ctx, callback);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(binder::handle(&tx_ctx).unwrap().pending_callbacks(), 0);
    }

    #[test]
    fn registration_after_rollback_is_dropped() {
        let (_store, ctx) = setup();
        let (tx_ctx, cleanup) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        let _ = cleanup.finish::<()>(Err(TxError::aborted("stop")));

        let (fired, callback) = flag();
        on_success(&tx_ctx, callback);
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(binder::handle(&tx_ctx).unwrap().pending_callbacks(), 0);
    }

    #[test]
    fn late_registration_on_released_savepoint_waits_for_outer() {
        let (_store, ctx) = setup();
        let (outer_ctx, outer) = begin_deferred(&ctx, &TxOptions::default()).unwrap();
        let (inner_ctx, inner) = begin_deferred(&outer_ctx, &TxOptions::default()).unwrap();
        inner.finish(Ok(())).unwrap();

        let (fired, callback) = flag();
        on_success(&inner_ctx, callback);
        assert!(!fired.load(Ordering::SeqCst));

        outer.finish(Ok(())).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    proptest! {
        #[test]
        fn callbacks_run_in_registration_order(n in 0usize..40) {
            let (_store, ctx) = setup();
            let order = Arc::new(Mutex::new(Vec::new()));

            with_deferred(&ctx, &TxOptions::default(), |tx_ctx| {
                for i in 0..n {
                    let order = Arc::clone(&order);
                    on_success(tx_ctx, move || order.lock().push(i));
                }
                Ok(())
            })
            .unwrap();

            prop_assert_eq!(order.lock().clone(), (0..n).collect::<Vec<_>>());
        }

        #[test]
        fn exactly_one_outcome(fail in any::<bool>(), panics in any::<bool>()) {
            let (store, ctx) = setup();
            let result: TxResult<()> = with_deferred(&ctx, &TxOptions::default(), |tx_ctx| {
                current(tx_ctx).unwrap().put("t", "k", vec![1])?;
                if panics {
                    panic!("fault");
                }
                if fail {
                    return Err(TxError::aborted("fail"));
                }
                Ok(())
            });

            let stats = store.stats();
            prop_assert_eq!(stats.commits + stats.rollbacks, 1);
            prop_assert_eq!(result.is_ok(), stats.commits == 1);
        }
    }
}
