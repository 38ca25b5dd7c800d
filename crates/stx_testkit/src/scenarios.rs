//! End-to-end transaction scenarios.
//!
//! Each scenario drives the public API the way application code would and
//! reports what is observable afterwards through the root context.

use crate::fixtures::TestContext;
use crate::stress::{concurrent_registration, StressConfig};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stx_core::{
    begin_deferred, current, on_success, run_in_transaction, Context, TxError, TxOptions, TxResult,
};

/// Table the scenarios write to.
pub const SCENARIO_TABLE: &str = "records";

/// Key of the record the scenarios write.
pub const SCENARIO_KEY: &str = "x";

/// Observable state after a scenario.
#[derive(Debug)]
pub struct ScenarioOutcome {
    /// Result of the transaction scope.
    pub result: TxResult<()>,
    /// Whether the record is visible through the root context.
    pub record_visible: bool,
    /// Whether the success callback fired.
    pub flag: bool,
}

fn write_record(ctx: &Context) -> TxResult<()> {
    let store = current(ctx).ok_or(TxError::NoStoreBound)?;
    store.put(SCENARIO_TABLE, SCENARIO_KEY, b"payload".to_vec())?;
    Ok(())
}

fn outcome(tc: &TestContext, result: TxResult<()>, flag: &AtomicBool) -> ScenarioOutcome {
    ScenarioOutcome {
        result,
        record_visible: tc.has_record(SCENARIO_TABLE, SCENARIO_KEY),
        flag: flag.load(Ordering::SeqCst),
    }
}

fn flag_setter(flag: &Arc<AtomicBool>) -> impl FnOnce() + Send + 'static {
    let setter = Arc::clone(flag);
    move || setter.store(true, Ordering::SeqCst)
}

/// Scenario A: a unit of work writes a record and succeeds.
pub fn scenario_commit() -> ScenarioOutcome {
    let tc = TestContext::memory();
    let flag = Arc::new(AtomicBool::new(false));
    let result = run_in_transaction(&tc, |tx_ctx| {
        write_record(tx_ctx)?;
        on_success(tx_ctx, flag_setter(&flag));
        Ok(())
    });
    outcome(&tc, result, &flag)
}

/// Scenario B: a unit of work writes a record, then fails.
pub fn scenario_rollback() -> ScenarioOutcome {
    let tc = TestContext::memory();
    let flag = Arc::new(AtomicBool::new(false));
    let result = run_in_transaction(&tc, |tx_ctx| {
        write_record(tx_ctx)?;
        on_success(tx_ctx, flag_setter(&flag));
        Err(TxError::aborted("validation failed"))
    });
    outcome(&tc, result, &flag)
}

/// Scenario C: a deferred scope writes, registers a callback, and succeeds.
pub fn scenario_deferred_commit() -> ScenarioOutcome {
    deferred_scenario(false)
}

/// Scenario D: a deferred scope writes, registers a callback, and panics.
pub fn scenario_deferred_panic() -> ScenarioOutcome {
    deferred_scenario(true)
}

fn deferred_scenario(fault: bool) -> ScenarioOutcome {
    let tc = TestContext::memory();
    let flag = Arc::new(AtomicBool::new(false));
    let result = run_deferred_region(&tc, &flag, fault);
    outcome(&tc, result, &flag)
}

fn run_deferred_region(ctx: &Context, flag: &Arc<AtomicBool>, fault: bool) -> TxResult<()> {
    let (tx_ctx, cleanup) = begin_deferred(ctx, &TxOptions::default())?;
    let region = panic::catch_unwind(AssertUnwindSafe(|| -> TxResult<()> {
        write_record(&tx_ctx)?;
        on_success(&tx_ctx, flag_setter(flag));
        if fault {
            panic!("fault in protected region");
        }
        Ok(())
    }));
    cleanup.recover(region)
}

/// Scenario E: ten threads register a counter increment on one transaction.
///
/// Returns the counter value after commit.
pub fn scenario_concurrent_callbacks() -> usize {
    let config = StressConfig {
        threads: 10,
        ops_per_thread: 1,
    };
    concurrent_registration(&config).successful_ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_committed_record_is_visible() {
        let outcome = scenario_commit();
        assert!(outcome.result.is_ok());
        assert!(outcome.record_visible);
        assert!(outcome.flag);
    }

    #[test]
    fn b_failed_unit_of_work_leaves_no_record() {
        let outcome = scenario_rollback();
        assert!(matches!(outcome.result, Err(TxError::Aborted { .. })));
        assert!(!outcome.record_visible);
        assert!(!outcome.flag);
    }

    #[test]
    fn c_deferred_commit_fires_callback() {
        let outcome = scenario_deferred_commit();
        assert!(outcome.result.is_ok());
        assert!(outcome.record_visible);
        assert!(outcome.flag);
    }

    #[test]
    fn d_fault_is_recovered_and_rolled_back() {
        let outcome = scenario_deferred_panic();
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, TxError::RecoveredFault { ref message, .. } if message == "fault in protected region"));
        assert!(!outcome.record_visible);
        assert!(!outcome.flag);
    }

    #[test]
    fn e_concurrent_callbacks_count_exactly_ten() {
        assert_eq!(scenario_concurrent_callbacks(), 10);
    }
}
