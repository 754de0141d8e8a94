//! Step contract and fault injection
//!
//! A step has a forward operation (`do_`) and a compensating operation
//! (`undo`). Contract: `do_` followed by `undo` must leave observable
//! external state equivalent to never having run the step. `undo` is called
//! only if its `do_` at least started; retries and reruns may cause multiple
//! invocations of either.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::FlightContext;

/// Status tag returned by a step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The attempt succeeded; advance in the current direction.
    Success,
    /// The step wants to run again without advancing (e.g. paginating work).
    Rerun,
    /// The flight should suspend, awaiting an external `resume` call.
    Wait,
    /// The runner should exit cleanly, returning the flight to `READY`.
    Stop,
    /// The flight should be re-queued from the top (debug / operator forced).
    RestartFlight,
    /// The attempt failed in a way the retry rule should evaluate.
    FailureRetry,
    /// The attempt failed in a way that is not retryable; triggers undo.
    FailureFatal,
}

/// The value returned by a step attempt: a status tag plus an optional
/// serialized exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            error: None,
        }
    }

    pub fn rerun() -> Self {
        Self {
            status: StepStatus::Rerun,
            error: None,
        }
    }

    pub fn wait() -> Self {
        Self {
            status: StepStatus::Wait,
            error: None,
        }
    }

    pub fn stop() -> Self {
        Self {
            status: StepStatus::Stop,
            error: None,
        }
    }

    pub fn restart_flight() -> Self {
        Self {
            status: StepStatus::RestartFlight,
            error: None,
        }
    }

    pub fn failure_retry(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::FailureRetry,
            error: Some(error.into()),
        }
    }

    pub fn failure_fatal(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::FailureFatal,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, StepStatus::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            StepStatus::FailureRetry | StepStatus::FailureFatal
        )
    }
}

/// A sentinel marker for step errors that the runner should classify as
/// `FAILURE_RETRY` rather than `FAILURE_FATAL`. Steps that want retry
/// semantics on an error path should return `StepResult::failure_retry`
/// directly rather than relying on this — the marker exists for step
/// implementations that propagate errors via `Result` internally and want a
/// single conversion point.
#[derive(Debug, Clone)]
pub struct RetryableError(pub String);

impl std::fmt::Display for RetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryableError {}

/// A single unit of work within a flight.
///
/// Implementers provide `do_` and `undo`. The pair of them is the flight's
/// unit of compensation: `do_` followed by `undo` must leave observable
/// external state equivalent to never having run.
#[async_trait]
pub trait Step: Send + Sync {
    /// Forward operation.
    async fn do_(&self, ctx: &mut FlightContext) -> StepResult;

    /// Compensating operation. Only invoked if `do_` was at least attempted.
    async fn undo(&self, ctx: &mut FlightContext) -> StepResult {
        let _ = ctx;
        StepResult::success()
    }

    /// Name used to key class-based debug fault injection. Defaults to the
    /// Rust type name; override for a stable name across refactors.
    fn step_class(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Fault-injection descriptor attached to a flight at submission time.
///
/// Immutable after submission (invariant 5). Each "failure once" map is
/// tracked in memory for the lifetime of one runner instantiation, so
/// re-entry after a restart re-arms the injection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlightDebugInfo {
    /// step_index -> forced status, applied once per index when doing.
    pub do_step_index_failures: HashMap<usize, StepStatus>,
    /// step_class -> forced status, applied once per class when doing.
    pub do_step_class_failures: HashMap<String, StepStatus>,
    /// step_index -> forced status, applied once per index when undoing.
    pub undo_step_index_failures: HashMap<usize, StepStatus>,
    /// step_class -> forced status, applied once per class when undoing.
    pub undo_step_class_failures: HashMap<String, StepStatus>,
    /// Force `FAILURE_FATAL` immediately after the final do-step succeeds.
    pub last_step_failure: bool,
    /// Force every step to report `RESTART_FLIGHT` after journaling.
    pub restart_each_step: bool,
}

/// Tracks which "failure once" injections have already fired, scoped to one
/// runner instantiation (cleared on every fresh `FlightRunner::new`).
#[derive(Debug, Default)]
pub(crate) struct DebugFaultState {
    fired_do_index: std::collections::HashSet<usize>,
    fired_do_class: std::collections::HashSet<String>,
    fired_undo_index: std::collections::HashSet<usize>,
    fired_undo_class: std::collections::HashSet<String>,
    fired_last_step: bool,
}

impl FlightDebugInfo {
    /// Resolve the forced status for a step attempt, if any, honoring the
    /// index-then-class-then-last-step precedence (§9 Open Question 1).
    /// Consumes the matching "once" entry so it does not re-fire within the
    /// same runner instantiation.
    pub(crate) fn resolve(
        &self,
        state: &mut DebugFaultState,
        step_index: usize,
        step_class: &str,
        undoing: bool,
        is_final_do_step: bool,
    ) -> Option<StepStatus> {
        if !undoing {
            if !state.fired_do_index.contains(&step_index) {
                if let Some(status) = self.do_step_index_failures.get(&step_index) {
                    state.fired_do_index.insert(step_index);
                    return Some(*status);
                }
            }
            if !state.fired_do_class.contains(step_class) {
                if let Some(status) = self.do_step_class_failures.get(step_class) {
                    state.fired_do_class.insert(step_class.to_string());
                    return Some(*status);
                }
            }
            if self.last_step_failure && is_final_do_step && !state.fired_last_step {
                state.fired_last_step = true;
                return Some(StepStatus::FailureFatal);
            }
        } else {
            if !state.fired_undo_index.contains(&step_index) {
                if let Some(status) = self.undo_step_index_failures.get(&step_index) {
                    state.fired_undo_index.insert(step_index);
                    return Some(*status);
                }
            }
            if !state.fired_undo_class.contains(step_class) {
                if let Some(status) = self.undo_step_class_failures.get(step_class) {
                    state.fired_undo_class.insert(step_class.to_string());
                    return Some(*status);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_result_constructors() {
        assert!(StepResult::success().is_success());
        assert!(StepResult::failure_retry("boom").is_failure());
        assert!(StepResult::failure_fatal("boom").is_failure());
        assert!(!StepResult::wait().is_failure());
    }

    #[test]
    fn debug_info_index_then_class_then_last_step() {
        let mut info = FlightDebugInfo::default();
        info.do_step_index_failures.insert(0, StepStatus::Wait);
        info.do_step_class_failures
            .insert("Charge".to_string(), StepStatus::Rerun);
        info.last_step_failure = true;

        let mut state = DebugFaultState::default();

        // Index match wins even though a class match also exists.
        assert_eq!(
            info.resolve(&mut state, 0, "Charge", false, false),
            Some(StepStatus::Wait)
        );
        // Once consumed, the index entry doesn't fire again; class wins next.
        assert_eq!(
            info.resolve(&mut state, 0, "Charge", false, false),
            Some(StepStatus::Rerun)
        );
        // Class entry also consumed now; last_step_failure only fires on the
        // final do-step.
        assert_eq!(info.resolve(&mut state, 0, "Charge", false, true), None);
        assert_eq!(
            info.resolve(&mut state, 1, "Other", false, true),
            Some(StepStatus::FailureFatal)
        );
        // last_step_failure is a once-per-instantiation flag too.
        assert_eq!(info.resolve(&mut state, 1, "Other", false, true), None);
    }

    #[test]
    fn debug_info_do_and_undo_are_independent() {
        let mut info = FlightDebugInfo::default();
        info.do_step_index_failures.insert(2, StepStatus::Stop);
        info.undo_step_index_failures
            .insert(2, StepStatus::FailureFatal);

        let mut state = DebugFaultState::default();
        assert_eq!(
            info.resolve(&mut state, 2, "X", false, false),
            Some(StepStatus::Stop)
        );
        assert_eq!(
            info.resolve(&mut state, 2, "X", true, false),
            Some(StepStatus::FailureFatal)
        );
    }
}
