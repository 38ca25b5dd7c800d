//! Immutable request-scoped value carrier.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A typed key for values stored in a [`Context`].
///
/// Keys are marker types, usually zero-sized and private to the module that
/// owns the value, so two modules can never collide on a key.
///
/// ```rust
/// use stx_core::{Context, ContextKey};
///
/// struct RequestId;
/// impl ContextKey for RequestId {
///     type Value = u64;
/// }
///
/// let ctx = Context::background().with_value::<RequestId>(42);
/// assert_eq!(ctx.value::<RequestId>(), Some(&42));
/// ```
pub trait ContextKey: 'static {
    /// Type of the value stored under this key.
    type Value: Send + Sync + 'static;
}

struct Node {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Context,
}

/// An immutable, appendable key-value carrier.
///
/// Contexts are never mutated: [`Context::with_value`] returns a new context
/// that extends the receiver. Cloning is cheap and clones can be sent to other
/// threads.
#[derive(Clone, Default)]
pub struct Context {
    node: Option<Arc<Node>>,
}

impl Context {
    /// Returns the empty root context.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a new context carrying `value` under key `K`.
    ///
    /// The new value shadows any value already stored under `K`.
    #[must_use]
    pub fn with_value<K: ContextKey>(&self, value: K::Value) -> Self {
        self.with_raw(TypeId::of::<K>(), Arc::new(value))
    }

    pub(crate) fn with_raw(&self, key: TypeId, value: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            node: Some(Arc::new(Node {
                key,
                value,
                parent: self.clone(),
            })),
        }
    }

    /// Returns the nearest value stored under key `K`.
    ///
    /// Returns `None` if nothing is stored under `K`, or if the nearest entry
    /// under `K` does not hold a `K::Value`.
    #[must_use]
    pub fn value<K: ContextKey>(&self) -> Option<&K::Value> {
        let key = TypeId::of::<K>();
        let mut cur = self;
        while let Some(node) = cur.node.as_deref() {
            if node.key == key {
                return node.value.downcast_ref::<K::Value>();
            }
            cur = &node.parent;
        }
        None
    }

    /// Number of values layered onto the background context.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self;
        while let Some(node) = cur.node.as_deref() {
            depth += 1;
            cur = &node.parent;
        }
        depth
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}
