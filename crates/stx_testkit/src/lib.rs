//! # STX Testkit
//!
//! Test utilities for STX.
//!
//! This crate provides:
//! - Context fixtures backed by an in-memory store
//! - Callback probes for observing commit callbacks
//! - Property-based scope plans using proptest
//! - Concurrency stress helpers
//! - End-to-end transaction scenarios
//!
//! ## Usage
//!
//! ```rust
//! use stx_testkit::prelude::*;
//!
//! with_test_context(|tc| {
//!     stx_core::run_in_transaction(tc, |tx_ctx| {
//!         stx_core::current(tx_ctx).unwrap().put("users", "a", vec![1])?;
//!         Ok(())
//!     })
//!     .unwrap();
//!     assert!(tc.has_record("users", "a"));
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenarios;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenarios::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scenarios::*;
pub use stress::*;
