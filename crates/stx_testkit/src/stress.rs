//! Stress tests for STX.
//!
//! These helpers hammer one context from many threads and verify that every
//! callback and every scope settles exactly once.

use crate::fixtures::{CallbackProbe, TestContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stx_core::{begin_deferred, current, on_success, run_in_transaction, TxError, TxOptions};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Operations each thread performs.
    pub ops_per_thread: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            ops_per_thread: 100,
        }
    }
}

/// Registers callbacks from many threads on one open transaction, then commits.
///
/// `successful_ops` is the number of callbacks that fired after the commit.
pub fn concurrent_registration(config: &StressConfig) -> StressTestResult {
    let tc = TestContext::memory();
    let probe = CallbackProbe::new();
    let start = Instant::now();

    let (tx_ctx, cleanup) =
        begin_deferred(&tc, &TxOptions::default()).expect("begin on a memory store");

    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let tx_ctx = tx_ctx.clone();
            let probe = probe.clone();
            let ops = config.ops_per_thread;
            thread::spawn(move || {
                for i in 0..ops {
                    on_success(&tx_ctx, probe.callback(t * ops + i));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let fired_before_commit = probe.fired();
    cleanup.finish(Ok(())).expect("commit on a memory store");

    let expected = config.threads * config.ops_per_thread;
    let fired = probe.fired() - fired_before_commit;
    StressTestResult::new(fired, expected.saturating_sub(fired), start.elapsed())
}

/// Runs independent transactions from many threads sharing one root context.
///
/// Every other operation fails on purpose; the result counts committed and
/// rolled-back scopes.
pub fn concurrent_scopes(config: &StressConfig) -> (StressTestResult, TestContext) {
    let tc = TestContext::memory();
    let ctx = tc.ctx.clone();
    let committed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let ctx = ctx.clone();
            let committed = Arc::clone(&committed);
            let failed = Arc::clone(&failed);
            let ops = config.ops_per_thread;
            thread::spawn(move || {
                for i in 0..ops {
                    let key = format!("{t}-{i}");
                    let result = run_in_transaction(&ctx, |tx_ctx| {
                        let store = current(tx_ctx).ok_or(TxError::NoStoreBound)?;
                        store.put("stress", &key, vec![0; 8])?;
                        if i % 2 == 1 {
                            return Err(TxError::aborted("odd operation"));
                        }
                        Ok(())
                    });
                    let counter = if result.is_ok() { &committed } else { &failed };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let result = StressTestResult::new(
        committed.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    (result, tc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_threads_register_on_one_transaction() {
        let config = StressConfig {
            threads: 10,
            ops_per_thread: 1,
        };
        let result = concurrent_registration(&config);
        assert_eq!(result.successful_ops, 10);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn many_registrations_all_fire_once() {
        let result = concurrent_registration(&StressConfig::default());
        assert_eq!(result.successful_ops, 1_000);
        assert_eq!(result.total_ops, 1_000);
    }

    #[test]
    fn independent_scopes_settle_exactly_once() {
        let config = StressConfig {
            threads: 8,
            ops_per_thread: 50,
        };
        let (result, tc) = concurrent_scopes(&config);

        assert_eq!(result.total_ops, 400);
        assert_eq!(result.successful_ops, 200);
        assert_eq!(tc.record_count("stress"), 200);

        let stats = tc.store.stats();
        assert_eq!(stats.begins, 400);
        assert_eq!(stats.commits, 200);
        assert_eq!(stats.rollbacks, 200);
    }
}
