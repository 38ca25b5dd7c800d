//! Test fixtures and context helpers.
//!
//! Provides convenience functions for setting up a context bound to an
//! in-memory store and for observing commit callbacks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stx_core::{attach, Context};
use stx_store::{MemoryStore, Store};

/// A context bound to a fresh in-memory store.
pub struct TestContext {
    /// Root handle of the store, kept for inspection.
    pub store: MemoryStore,
    /// Background context with the store attached.
    pub ctx: Context,
}

impl TestContext {
    /// Creates a context bound to a new in-memory store.
    pub fn memory() -> Self {
        let store = MemoryStore::new();
        let ctx = attach(&Context::background(), store.clone().into_ref());
        Self { store, ctx }
    }

    /// Returns true if `key` is committed in `table`.
    pub fn has_record(&self, table: &str, key: &str) -> bool {
        self.store
            .get(table, key)
            .expect("root reads never fail")
            .is_some()
    }

    /// Number of committed records in `table`.
    pub fn record_count(&self, table: &str) -> usize {
        self.store.count(table).expect("root reads never fail")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::memory()
    }
}

impl std::ops::Deref for TestContext {
    type Target = Context;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

/// Runs a test with a fresh [`TestContext`].
pub fn with_test_context<F, R>(f: F) -> R
where
    F: FnOnce(&TestContext) -> R,
{
    let tc = TestContext::memory();
    f(&tc)
}

/// Records which callbacks fired and in what order.
#[derive(Debug, Clone, Default)]
pub struct CallbackProbe {
    fired: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<usize>>>,
}

impl CallbackProbe {
    /// Creates an empty probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a callback that records `id` when run.
    pub fn callback(&self, id: usize) -> impl FnOnce() + Send + 'static {
        let fired = Arc::clone(&self.fired);
        let order = Arc::clone(&self.order);
        move || {
            order.lock().push(id);
            fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of callbacks that have run.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    /// Ids of the callbacks that have run, in execution order.
    pub fn order(&self) -> Vec<usize> {
        self.order.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stx_core::{is_active, on_success};

    #[test]
    fn memory_context_is_bound_but_idle() {
        let tc = TestContext::memory();
        assert!(stx_core::current(&tc).is_some());
        assert!(!is_active(&tc));
    }

    #[test]
    fn with_test_context_runs() {
        let count = with_test_context(|tc| tc.record_count("users"));
        assert_eq!(count, 0);
    }

    #[test]
    fn probe_records_order() {
        let probe = CallbackProbe::new();
        on_success(&Context::background(), probe.callback(2));
        on_success(&Context::background(), probe.callback(1));

        assert_eq!(probe.fired(), 2);
        assert_eq!(probe.order(), vec![2, 1]);
    }
}
