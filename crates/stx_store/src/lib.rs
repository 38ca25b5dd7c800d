//! # STX Store
//!
//! The store capability consumed by `stx_core`.
//!
//! A store is an **opaque transactional backend**. The context container never
//! looks inside it; it only needs to:
//!
//! - begin, commit, and roll back transactions (savepoints when nested)
//! - run a closure inside a transaction
//! - report the identity of the connection a handle is bound to
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - In-memory store with savepoints, for tests and demos
//!
//! ## Example
//!
//! ```rust
//! use stx_store::{MemoryStore, Store, TxOptions};
//!
//! let store = MemoryStore::new();
//! let tx = store.begin_tx(&TxOptions::default()).unwrap();
//! tx.put("users", "alice", b"admin".to_vec()).unwrap();
//! tx.commit().unwrap();
//! assert_eq!(store.get("users", "alice").unwrap(), Some(b"admin".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod options;
mod store;

pub use error::{BoxError, RunError, StoreError, StoreResult};
pub use memory::{MemoryStats, MemoryStore};
pub use options::{IsolationLevel, TxOptions};
pub use store::{ConnectionId, Store, StoreRef, TxFn};
