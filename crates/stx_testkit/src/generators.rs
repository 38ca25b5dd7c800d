//! Property-based test generators using proptest.
//!
//! A [`ScopePlan`] describes a unit of work: writes, callback registrations,
//! a nested scope, and how the scope ends. [`execute_plan`] runs a plan
//! through the deferred API and reports what happened, so properties can be
//! checked against [`ScopePlan::should_commit`].

use crate::fixtures::{CallbackProbe, TestContext};
use proptest::prelude::*;
use stx_core::{
    current, on_success, run_in_transaction, with_deferred, Context, TxError, TxOptions, TxResult,
};

/// Table every plan writes to.
pub const PLAN_TABLE: &str = "plan";

/// How a scope ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// Return `Ok`.
    Succeed,
    /// Return an error.
    Fail,
    /// Panic.
    Panic,
}

/// One action inside a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write a record with this key.
    Write(String),
    /// Register a success callback.
    Callback,
}

/// A scope to execute, optionally wrapping one nested scope.
#[derive(Debug, Clone)]
pub struct ScopePlan {
    /// Actions before the nested scope.
    pub steps: Vec<Step>,
    /// Nested scope run with `run_in_transaction`.
    pub nested: Option<Box<ScopePlan>>,
    /// How this scope ends.
    pub ending: Ending,
}

impl ScopePlan {
    /// Whether the outermost scope should commit.
    ///
    /// Nested failures propagate outward, so every scope must succeed.
    pub fn should_commit(&self) -> bool {
        self.ending == Ending::Succeed && self.nested.as_ref().map_or(true, |n| n.should_commit())
    }

    /// Whether running the plan ends in a panic.
    ///
    /// A failed nested scope returns early, so the outer ending never runs.
    pub fn panics(&self) -> bool {
        match &self.nested {
            Some(nested) if nested.panics() => true,
            Some(nested) if !nested.should_commit() => false,
            _ => self.ending == Ending::Panic,
        }
    }

    /// Distinct keys written anywhere in the plan.
    pub fn written_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::Write(key) => Some(key.clone()),
                Step::Callback => None,
            })
            .collect();
        if let Some(nested) = &self.nested {
            keys.extend(nested.written_keys());
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Number of callbacks registered anywhere in the plan.
    pub fn callback_count(&self) -> usize {
        let own = self
            .steps
            .iter()
            .filter(|step| matches!(step, Step::Callback))
            .count();
        own + self.nested.as_ref().map_or(0, |n| n.callback_count())
    }
}

/// Generates a single step.
pub fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        "[a-h]".prop_map(Step::Write),
        Just(Step::Callback),
    ]
}

/// Generates a scope ending, biased toward success.
pub fn ending_strategy() -> impl Strategy<Value = Ending> {
    prop_oneof![
        3 => Just(Ending::Succeed),
        1 => Just(Ending::Fail),
        1 => Just(Ending::Panic),
    ]
}

/// Generates a scope plan with at most one level of nesting.
pub fn scope_plan_strategy() -> impl Strategy<Value = ScopePlan> {
    let leaf = (prop::collection::vec(step_strategy(), 0..8), ending_strategy()).prop_map(
        |(steps, ending)| ScopePlan {
            steps,
            nested: None,
            ending,
        },
    );

    (
        prop::collection::vec(step_strategy(), 0..8),
        prop::option::of(leaf),
        ending_strategy(),
    )
        .prop_map(|(steps, nested, ending)| ScopePlan {
            steps,
            nested: nested.map(Box::new),
            ending,
        })
}

/// What happened when a plan ran.
#[derive(Debug)]
pub struct PlanOutcome {
    /// Result of the outermost scope.
    pub result: TxResult<()>,
    /// Callbacks that fired.
    pub callbacks_fired: usize,
    /// Keys committed to [`PLAN_TABLE`].
    pub committed_keys: Vec<String>,
}

/// Runs `plan` against a fresh in-memory store.
pub fn execute_plan(plan: &ScopePlan) -> PlanOutcome {
    let tc = TestContext::memory();
    let probe = CallbackProbe::new();

    let result = with_deferred(&tc, &TxOptions::default(), |tx_ctx| {
        run_scope(tx_ctx, plan, &probe)
    });

    PlanOutcome {
        result,
        callbacks_fired: probe.fired(),
        committed_keys: tc.store.committed(PLAN_TABLE).into_keys().collect(),
    }
}

fn run_scope(ctx: &Context, plan: &ScopePlan, probe: &CallbackProbe) -> TxResult<()> {
    let store = current(ctx).ok_or(TxError::NoStoreBound)?;
    for (i, step) in plan.steps.iter().enumerate() {
        match step {
            Step::Write(key) => store.put(PLAN_TABLE, key, vec![1])?,
            Step::Callback => on_success(ctx, probe.callback(i)),
        }
    }

    if let Some(nested) = &plan.nested {
        run_in_transaction(ctx, |inner| run_scope(inner, nested, probe))?;
    }

    match plan.ending {
        Ending::Succeed => Ok(()),
        Ending::Fail => Err(TxError::aborted("planned failure")),
        Ending::Panic => panic!("planned panic"),
    }
}
