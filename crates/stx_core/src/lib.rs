//! # STX Core
//!
//! Context-scoped transactions.
//!
//! A [`Context`] carries at most one transaction handle down a call chain, so
//! functions deep in the chain can reach the current store without it being
//! threaded through every signature. This crate provides:
//! - Binding a store into a context ([`attach`], [`current`])
//! - Manual transaction control ([`begin`], [`commit`], [`rollback`], [`is_active`])
//! - Closure-scoped transactions ([`run_in_transaction`])
//! - Guard-scoped, panic-safe transactions ([`begin_deferred`], [`with_deferred`])
//! - Callbacks that fire only after a real commit ([`on_success`])
//!
//! ## Example
//!
//! ```rust
//! use stx_core::{attach, current, on_success, run_in_transaction, Context};
//! use stx_store::MemoryStore;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new();
//! let ctx = attach(&Context::background(), store.clone().into_ref());
//! let sent = Arc::new(AtomicBool::new(false));
//!
//! let flag = Arc::clone(&sent);
//! run_in_transaction(&ctx, |tx_ctx| {
//!     current(tx_ctx).unwrap().put("users", "alice", b"{}".to_vec())?;
//!     on_success(tx_ctx, move || flag.store(true, Ordering::SeqCst));
//!     Ok(())
//! })
//! .unwrap();
//!
//! assert!(sent.load(Ordering::SeqCst));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod binder;
mod context;
mod controller;
mod deferred;
mod error;
mod runner;

pub use binder::{attach, current, SuccessCallback, TransactionHandle};
pub use context::{Context, ContextKey};
pub use controller::{begin, commit, is_active, rollback};
pub use deferred::{begin_deferred, on_success, with_deferred, Cleanup, ScopeState};
pub use error::{TxError, TxResult};
pub use runner::{run_in_transaction, run_in_transaction_with};

pub use stx_store::{IsolationLevel, Store, StoreError, StoreRef, TxOptions};
