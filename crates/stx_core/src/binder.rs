//! Binding transaction handles into contexts.

use crate::context::{Context, ContextKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use stx_store::StoreRef;
use tracing::trace;

/// A side effect deferred until the enclosing transaction commits.
pub type SuccessCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    Committed,
    RolledBack,
}

struct CallbackQueue {
    state: QueueState,
    callbacks: Vec<SuccessCallback>,
}

/// The unit of shared state a context carries.
///
/// A handle pairs a store with the queue of callbacks registered against it,
/// and links to the handle of the context it was attached to. The store is
/// fixed at construction; beginning a transaction produces a new handle
/// rather than swapping the store of an existing one. The queue is the only
/// mutable part. Once the transaction settles, the queue is closed and later
/// registrations are routed by the outcome instead of queued.
pub struct TransactionHandle {
    store: StoreRef,
    parent: Option<Arc<TransactionHandle>>,
    queue: Mutex<CallbackQueue>,
}

impl TransactionHandle {
    pub(crate) fn new(store: StoreRef, parent: Option<Arc<TransactionHandle>>) -> Self {
        Self {
            store,
            parent,
            queue: Mutex::new(CallbackQueue {
                state: QueueState::Open,
                callbacks: Vec::new(),
            }),
        }
    }

    /// Returns the store this handle is bound to.
    #[must_use]
    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    /// Returns the handle of the context this one was attached to.
    #[must_use]
    pub fn parent(&self) -> Option<&TransactionHandle> {
        self.parent.as_deref()
    }

    /// Returns true if the bound store is inside a transaction.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.store.is_transactional()
    }

    /// Returns true once the transaction has committed or rolled back.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.queue.lock().state != QueueState::Open
    }

    /// Number of callbacks waiting for commit.
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.queue.lock().callbacks.len()
    }

    /// Queues `callback` until the transaction settles.
    ///
    /// Hands the callback back if the transaction already committed, so the
    /// caller can pass it on. A callback registered after a rollback is
    /// dropped.
    pub(crate) fn enqueue(&self, callback: SuccessCallback) -> Option<SuccessCallback> {
        let mut queue = self.queue.lock();
        match queue.state {
            QueueState::Open => {
                queue.callbacks.push(callback);
                None
            }
            QueueState::Committed => Some(callback),
            QueueState::RolledBack => {
                trace!("dropping callback registered after rollback");
                None
            }
        }
    }

    /// Closes the queue as committed and takes every queued callback.
    pub(crate) fn mark_committed(&self) -> Vec<SuccessCallback> {
        let mut queue = self.queue.lock();
        queue.state = QueueState::Committed;
        std::mem::take(&mut queue.callbacks)
    }

    /// Closes the queue as rolled back and drops every queued callback.
    ///
    /// Returns how many were dropped.
    pub(crate) fn discard(&self) -> usize {
        let dropped = {
            let mut queue = self.queue.lock();
            queue.state = QueueState::RolledBack;
            std::mem::take(&mut queue.callbacks)
        };
        dropped.len()
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("TransactionHandle")
            .field("store", &self.store)
            .field("state", &queue.state)
            .field("pending_callbacks", &queue.callbacks.len())
            .finish_non_exhaustive()
    }
}

struct HandleKey;

impl ContextKey for HandleKey {
    type Value = Arc<TransactionHandle>;
}

/// Returns a context extending `parent` with a fresh handle around `store`.
#[must_use]
pub fn attach(parent: &Context, store: StoreRef) -> Context {
    let tx_handle = TransactionHandle::new(store, handle(parent));
    parent.with_value::<HandleKey>(Arc::new(tx_handle))
}

/// Returns the store bound to the nearest handle in `ctx`, if any.
#[must_use]
pub fn current(ctx: &Context) -> Option<StoreRef> {
    handle(ctx).map(|handle| Arc::clone(handle.store()))
}

pub(crate) fn handle(ctx: &Context) -> Option<Arc<TransactionHandle>> {
    ctx.value::<HandleKey>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;
    use stx_store::{MemoryStore, Store};

    #[test]
    fn attach_then_current() {
        let store = MemoryStore::new();
        let ctx = attach(&Context::background(), store.clone().into_ref());

        let bound = current(&ctx).expect("store should be bound");
        assert_eq!(bound.connection_id(), store.connection_id());
    }

    #[test]
    fn current_on_background_is_none() {
        assert!(current(&Context::background()).is_none());
    }

    #[test]
    fn current_ignores_malformed_handle() {
        let ctx = Context::background().with_raw(TypeId::of::<HandleKey>(), Arc::new("invalid"));
        assert!(current(&ctx).is_none());
    }

    #[test]
    fn nearest_handle_wins() {
        let outer = MemoryStore::new();
        let inner = MemoryStore::new();
        let ctx = attach(&Context::background(), outer.into_ref());
        let nested = attach(&ctx, inner.clone().into_ref());

        let bound = current(&nested).unwrap();
        assert_eq!(bound.connection_id(), inner.connection_id());
    }

    #[test]
    fn attach_starts_with_empty_queue() {
        let ctx = attach(&Context::background(), MemoryStore::new().into_ref());
        let handle = handle(&ctx).unwrap();
        assert_eq!(handle.pending_callbacks(), 0);
    }

    #[test]
    fn attach_links_enclosing_handle() {
        let root = attach(&Context::background(), MemoryStore::new().into_ref());
        assert!(handle(&root).unwrap().parent().is_none());

        let nested = attach(&root, MemoryStore::new().into_ref());
        assert!(handle(&nested).unwrap().parent().is_some());
    }

    #[test]
    fn mark_committed_takes_queue_and_closes_it() {
        let handle = TransactionHandle::new(MemoryStore::new().into_ref(), None);
        assert!(handle.enqueue(Box::new(|| {})).is_none());
        assert!(handle.enqueue(Box::new(|| {})).is_none());

        assert_eq!(handle.mark_committed().len(), 2);
        assert_eq!(handle.pending_callbacks(), 0);
        assert!(handle.is_settled());

        assert!(handle.enqueue(Box::new(|| {})).is_some());
        assert_eq!(handle.pending_callbacks(), 0);
    }

    #[test]
    fn discard_drops_queue_and_later_registrations() {
        let handle = TransactionHandle::new(MemoryStore::new().into_ref(), None);
        assert!(handle.enqueue(Box::new(|| {})).is_none());

        assert_eq!(handle.discard(), 1);
        assert!(handle.enqueue(Box::new(|| {})).is_none());
        assert_eq!(handle.pending_callbacks(), 0);
    }

    #[test]
    fn handles_are_shared_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransactionHandle>();
        assert_send_sync::<Context>();
    }
}
