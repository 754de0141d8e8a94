//! Flight runner: the do/undo/switch state machine
//!
//! A `FlightRunner` owns one flight's [`FlightContext`] exclusively for the
//! duration of a `run()` call. Nothing else touches that context while it's
//! in flight, which is why every method here takes `&mut self` instead of
//! going through a lock: single ownership is enforced by construction (the
//! journal only ever hands the flight to one runner via `claim_owner`), not
//! by a runtime guard.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, ExceptionCodec};
use crate::context::{Direction, FlightContext, FlightStatus};
use crate::hook::HookWrapper;
use crate::journal::{FlightState, Journal, JournalError};
use crate::retry::RetryRule;
use crate::step::{DebugFaultState, Step, StepResult, StepStatus};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("flight run cancelled")]
    Cancelled,

    #[error("step count ({steps}) does not match retry rule count ({rules})")]
    StepRuleCountMismatch { steps: usize, rules: usize },
}

/// Drives one flight's steps to completion or suspension.
pub struct FlightRunner {
    owner: String,
    journal: Arc<dyn Journal>,
    hooks: Arc<HookWrapper>,
    exception_codec: Arc<dyn ExceptionCodec>,
    steps: Vec<Arc<dyn Step>>,
    retry_rules: Vec<Box<dyn RetryRule>>,
    debug_state: DebugFaultState,
    cancellation: CancellationToken,
    quieting: Arc<AtomicBool>,
    ctx: FlightContext,
}

impl FlightRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: FlightContext,
        owner: impl Into<String>,
        journal: Arc<dyn Journal>,
        hooks: Arc<HookWrapper>,
        exception_codec: Arc<dyn ExceptionCodec>,
        steps: Vec<Arc<dyn Step>>,
        retry_rules: Vec<Box<dyn RetryRule>>,
        cancellation: CancellationToken,
        quieting: Arc<AtomicBool>,
    ) -> Result<Self, RunnerError> {
        if steps.len() != retry_rules.len() {
            return Err(RunnerError::StepRuleCountMismatch {
                steps: steps.len(),
                rules: retry_rules.len(),
            });
        }
        Ok(Self {
            owner: owner.into(),
            journal,
            hooks,
            exception_codec,
            steps,
            retry_rules,
            debug_state: DebugFaultState::default(),
            cancellation,
            quieting,
            ctx,
        })
    }

    pub fn context(&self) -> &FlightContext {
        &self.ctx
    }

    /// Run the flight until it reaches a terminal status (`SUCCESS`,
    /// `ERROR`, `FATAL`) or suspends (`WAITING`, `READY`,
    /// `READY_TO_RESTART`), releasing ownership either way.
    #[tracing::instrument(skip(self), fields(flight_id = %self.ctx.flight_id, class_name = %self.ctx.class_name))]
    pub async fn run(&mut self) -> Result<FlightStatus, RunnerError> {
        self.hooks.start_flight(&self.ctx).await;

        if self.quieting.load(AtomicOrdering::SeqCst) {
            let status = FlightStatus::Ready;
            let outcome = self.release(status).await.map(|_| status);
            self.hooks.end_flight(&self.ctx).await;
            return outcome;
        }

        for rule in &mut self.retry_rules {
            rule.initialize();
        }

        let outcome = self.fly().await;

        self.hooks.end_flight(&self.ctx).await;
        outcome
    }

    /// Disowns the flight back to `READY` instead of propagating
    /// `RunnerError::Cancelled` — a cancelled run still must not leave the
    /// journal row owned and `RUNNING` forever.
    async fn finish_cancelled(&mut self) -> Result<FlightStatus, RunnerError> {
        self.release(FlightStatus::Ready).await?;
        Ok(FlightStatus::Ready)
    }

    async fn fly(&mut self) -> Result<FlightStatus, RunnerError> {
        self.ctx.advance();

        let mut pending_terminal: Option<FlightStatus> = None;

        loop {
            if self.cancellation.is_cancelled() {
                return self.finish_cancelled().await;
            }

            if !self.ctx.have_step_to_do() {
                let status = pending_terminal.unwrap_or(FlightStatus::Success);
                self.release(status).await?;
                return Ok(status);
            }

            let mut result = match self.run_steps().await {
                Ok(result) => result,
                Err(RunnerError::Cancelled) => return self.finish_cancelled().await,
                Err(err) => return Err(err),
            };
            if self.quieting.load(AtomicOrdering::SeqCst)
                && matches!(result.status, StepStatus::Success | StepStatus::Rerun)
            {
                result.status = StepStatus::Stop;
            }
            self.ctx.last_result = Some(result.clone());

            match result.status {
                StepStatus::Success => {
                    let was_switch = self.ctx.direction == Direction::Switch;
                    self.ctx.rerun = false;
                    if was_switch {
                        self.ctx.direction = Direction::Undo;
                    }
                    self.ctx.advance();
                }
                StepStatus::Rerun => {
                    self.ctx.rerun = true;
                    self.ctx.advance();
                }
                StepStatus::Wait => {
                    self.release(FlightStatus::Waiting).await?;
                    return Ok(FlightStatus::Waiting);
                }
                StepStatus::Stop => {
                    self.release(FlightStatus::Ready).await?;
                    return Ok(FlightStatus::Ready);
                }
                StepStatus::RestartFlight => {
                    self.release(FlightStatus::ReadyToRestart).await?;
                    return Ok(FlightStatus::ReadyToRestart);
                }
                StepStatus::FailureRetry | StepStatus::FailureFatal => {
                    self.ctx.rerun = false;
                    // A failure while already undoing is dismal: the
                    // compensation path itself failed. A failure during the
                    // do leg only ever yields FATAL if the subsequent undo
                    // also fails — success of the undo leg always reports
                    // ERROR, regardless of which failure kind triggered it.
                    if matches!(self.ctx.direction, Direction::Undo | Direction::Switch) {
                        self.release(FlightStatus::Fatal).await?;
                        return Ok(FlightStatus::Fatal);
                    }
                    pending_terminal = Some(FlightStatus::Error);
                    self.ctx.direction = Direction::Switch;
                }
            }
        }
    }

    async fn run_steps(&mut self) -> Result<StepResult, RunnerError> {
        let index = self.ctx.current_step_index();
        self.step_with_retry(index).await
    }

    async fn step_with_retry(&mut self, index: usize) -> Result<StepResult, RunnerError> {
        let step = self.steps[index].clone();
        let step_class = step.step_class().to_string();
        let undoing = matches!(self.ctx.direction, Direction::Undo | Direction::Switch);
        let is_final_do_step = self.ctx.is_final_do_step();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancellation.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }

            self.hooks.start_step(&self.ctx, &step_class).await;

            let forced = self.ctx.debug_info.resolve(
                &mut self.debug_state,
                index,
                &step_class,
                undoing,
                is_final_do_step,
            );

            let result = if let Some(status) = forced {
                StepResult {
                    status,
                    error: Some(format!("forced by debug info at step {index}")),
                }
            } else if undoing {
                step.undo(&mut self.ctx).await
            } else {
                step.do_(&mut self.ctx).await
            };

            self.hooks.end_step(&self.ctx, &step_class, &result).await;

            self.journal
                .append_log(
                    &self.ctx.flight_id,
                    &self.owner,
                    self.ctx.step_index,
                    self.ctx.direction,
                    self.ctx.rerun,
                    attempt,
                    result.clone(),
                    self.ctx.working.raw().clone(),
                )
                .await?;

            if self.ctx.persisted.is_dirty() {
                self.journal
                    .flush_persisted(
                        &self.ctx.flight_id,
                        &self.owner,
                        self.ctx.persisted.raw().clone(),
                    )
                    .await?;
                self.ctx.persisted.clear_dirty();
            }

            if self.ctx.debug_info.restart_each_step {
                return Ok(StepResult::restart_flight());
            }

            if !matches!(result.status, StepStatus::FailureRetry) {
                return Ok(result);
            }

            if self.quieting.load(AtomicOrdering::SeqCst) {
                return Ok(result);
            }

            tokio::select! {
                should_retry = self.retry_rules[index].sleep_and_decide() => {
                    if should_retry {
                        continue;
                    }
                    return Ok(result);
                }
                _ = self.cancellation.cancelled() => {
                    return Err(RunnerError::Cancelled);
                }
            }
        }
    }

    async fn release(&mut self, status: FlightStatus) -> Result<(), RunnerError> {
        let from = self.ctx.status;
        self.ctx.status = status;
        let error = match self.ctx.last_result.as_ref().and_then(|r| r.error.as_deref()) {
            Some(raw) => Some(self.exception_codec.encode_error(raw)?),
            None => None,
        };
        self.journal
            .release_owner(
                &self.ctx.flight_id,
                &self.owner,
                FlightState {
                    status,
                    direction: self.ctx.direction,
                    step_index: self.ctx.step_index,
                },
                error,
            )
            .await?;
        self.hooks.state_transition(&self.ctx, from, status).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonExceptionCodec;
    use crate::context::ParamMap;
    use crate::journal::InMemoryJournal;
    use crate::retry::{FixedInterval, NoRetry};
    use crate::step::FlightDebugInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct AlwaysSucceeds;

    #[async_trait]
    impl Step for AlwaysSucceeds {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::success()
        }
    }

    struct FailsThenSucceeds {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Step for FailsThenSucceeds {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                StepResult::failure_retry("transient")
            } else {
                StepResult::success()
            }
        }
    }

    struct AlwaysFatal;

    #[async_trait]
    impl Step for AlwaysFatal {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::failure_fatal("boom")
        }

        async fn undo(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::success()
        }
    }

    async fn setup(
        journal: Arc<InMemoryJournal>,
        flight_id: &str,
        owner: &str,
        steps: Vec<Arc<dyn Step>>,
        retry_rules: Vec<Box<dyn RetryRule>>,
    ) -> FlightRunner {
        let row = journal
            .create_flight(flight_id, "TestFlight", owner, Default::default(), FlightDebugInfo::default())
            .await
            .unwrap();
        let ctx = FlightContext::new(
            row.flight_id,
            row.class_name,
            ParamMap::sealed(row.input),
            steps.len(),
            row.debug_info,
        );
        FlightRunner::new(
            ctx,
            owner,
            journal,
            Arc::new(HookWrapper::new()),
            Arc::new(JsonExceptionCodec),
            steps,
            retry_rules,
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn happy_path_reaches_success() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut runner = setup(
            journal.clone(),
            "f1",
            "owner-a",
            vec![Arc::new(AlwaysSucceeds), Arc::new(AlwaysSucceeds)],
            vec![Box::new(NoRetry), Box::new(NoRetry)],
        )
        .await;

        let status = runner.run().await.unwrap();
        assert_eq!(status, FlightStatus::Success);

        let row = journal.load("f1").await.unwrap().unwrap();
        assert_eq!(row.state.status, FlightStatus::Success);
        assert!(row.owner.is_none());
    }

    #[tokio::test]
    async fn retry_then_success() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut runner = setup(
            journal.clone(),
            "f1",
            "owner-a",
            vec![Arc::new(FailsThenSucceeds {
                attempts: AtomicU32::new(0),
            })],
            vec![Box::new(FixedInterval::new(Duration::from_millis(1), 3))],
        )
        .await;

        let status = runner.run().await.unwrap();
        assert_eq!(status, FlightStatus::Success);

        let log = journal.load_log("f1").await.unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn fatal_failure_undoes_successfully_then_reports_error() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut runner = setup(
            journal.clone(),
            "f1",
            "owner-a",
            vec![Arc::new(AlwaysSucceeds), Arc::new(AlwaysFatal)],
            vec![Box::new(NoRetry), Box::new(NoRetry)],
        )
        .await;

        let status = runner.run().await.unwrap();
        assert_eq!(status, FlightStatus::Error);

        let log = journal.load_log("f1").await.unwrap();
        // step0 do, step1 do (fatal), step1 undo, step0 undo
        assert_eq!(log.len(), 4);
        assert_eq!(log.last().unwrap().step_index, 0);
        assert_eq!(log.last().unwrap().direction, Direction::Undo);
    }

    struct UndoAlsoFails;

    #[async_trait]
    impl Step for UndoAlsoFails {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::success()
        }

        async fn undo(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::failure_fatal("undo boom")
        }
    }

    #[tokio::test]
    async fn undo_failure_is_dismal() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut runner = setup(
            journal.clone(),
            "f1",
            "owner-a",
            vec![Arc::new(UndoAlsoFails), Arc::new(AlwaysFatal)],
            vec![Box::new(NoRetry), Box::new(NoRetry)],
        )
        .await;

        let status = runner.run().await.unwrap();
        assert_eq!(status, FlightStatus::Fatal);

        let log = journal.load_log("f1").await.unwrap();
        // step0 do, step1 do (fatal), step1 undo, step0 undo (fails)
        assert_eq!(log.len(), 4);
        let last = log.last().unwrap();
        assert_eq!(last.step_index, 0);
        assert_eq!(last.direction, Direction::Undo);
        assert!(last.result.is_failure());
    }

    #[tokio::test]
    async fn cancellation_stops_the_runner() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut runner = setup(
            journal.clone(),
            "f1",
            "owner-a",
            vec![Arc::new(AlwaysSucceeds)],
            vec![Box::new(NoRetry)],
        )
        .await;
        runner.cancellation.cancel();

        let status = runner.run().await.unwrap();
        assert_eq!(status, FlightStatus::Ready);

        let row = journal.load("f1").await.unwrap().unwrap();
        assert_eq!(row.state.status, FlightStatus::Ready);
        assert!(row.owner.is_none());
    }

    #[tokio::test]
    async fn quieting_down_stops_at_next_step_boundary() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut runner = setup(
            journal.clone(),
            "f1",
            "owner-a",
            vec![Arc::new(AlwaysSucceeds), Arc::new(AlwaysSucceeds)],
            vec![Box::new(NoRetry), Box::new(NoRetry)],
        )
        .await;
        runner.quieting.store(true, Ordering::SeqCst);

        let status = runner.run().await.unwrap();
        assert_eq!(status, FlightStatus::Ready);

        let row = journal.load("f1").await.unwrap().unwrap();
        assert_eq!(row.state.status, FlightStatus::Ready);
        assert!(row.owner.is_none());
        // Quiescing exits before the startFlight-gated check even runs a
        // step, so no log entries are appended.
        assert!(journal.load_log("f1").await.unwrap().is_empty());
    }
}
