//! Generic prepare → execute → finish stage controller.
//!
//! Epistemic foundation:
//! - K_i: `finished ⇒ done ⇒ prepared` holds by construction of `StageState`
//! - K_i: A result payload exists iff the stage is done
//! - B_i: Each phase may fail → `StageFailure`, state left where it was
//! - I^B: A stage may keep asking for retries → bounded by `max_retries`

use crate::models::{ReductionError, Result, StageId, StageSnapshot, StageStatus, SweepKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle position of a stage, carrying the result once executed.
#[derive(Debug, Clone, PartialEq)]
pub enum StageState<T> {
    Unprepared,
    Prepared,
    Done(T),
    Finished(T),
}

impl<T> StageState<T> {
    pub fn prepared(&self) -> bool {
        !matches!(self, Self::Unprepared)
    }

    pub fn done(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Finished(_))
    }

    pub fn finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    /// Result payload, defined iff `done`.
    pub fn result(&self) -> Option<&T> {
        match self {
            Self::Done(out) | Self::Finished(out) => Some(out),
            Self::Unprepared | Self::Prepared => None,
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            Self::Unprepared => StageStatus::Unprepared,
            Self::Prepared => StageStatus::Prepared,
            Self::Done(_) => StageStatus::Done,
            Self::Finished(_) => StageStatus::Finished,
        }
    }
}

/// How far back a retry sends the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rewind {
    /// `prepared = false`: re-run prepare, execute and finish
    Prepare,
    /// `done = false`: re-run execute and finish
    Execute,
}

/// Request from a phase to loop back instead of advancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    pub rewind: Rewind,
    pub reason: String,
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Advance(T),
    Retry(RetryRequest),
}

impl<T> Step<T> {
    pub fn retry_prepare(reason: impl Into<String>) -> Self {
        Self::Retry(RetryRequest {
            rewind: Rewind::Prepare,
            reason: reason.into(),
        })
    }

    pub fn retry_execute(reason: impl Into<String>) -> Self {
        Self::Retry(RetryRequest {
            rewind: Rewind::Execute,
            reason: reason.into(),
        })
    }
}

/// One processing stage driven by a `StageController`.
pub trait Stage {
    /// What the stage needs from its caller on every phase
    type Context: ?Sized;
    /// Result payload
    type Output: Clone;

    fn id(&self) -> StageId;

    /// Sweep this stage belongs to, for per-sweep stages.
    fn sweep(&self) -> Option<&SweepKey> {
        None
    }

    /// Assemble parameters and inputs.
    fn prepare(&mut self, ctx: &mut Self::Context) -> Result<Step<()>>;

    /// Run the backend.
    fn execute(&mut self, ctx: &mut Self::Context) -> Result<Step<Self::Output>>;

    /// Post-process and reconcile the result.
    fn finish(&mut self, _ctx: &mut Self::Context, _output: &mut Self::Output) -> Result<Step<()>> {
        Ok(Step::Advance(()))
    }
}

/// Per-stage bookkeeping owned by the controller.
#[derive(Debug, Clone)]
pub struct StageRecord<T> {
    state: StageState<T>,
    resets: u32,
    executions: u32,
}

impl<T> Default for StageRecord<T> {
    fn default() -> Self {
        Self {
            state: StageState::Unprepared,
            resets: 0,
            executions: 0,
        }
    }
}

impl<T> StageRecord<T> {
    pub fn state(&self) -> &StageState<T> {
        &self.state
    }

    pub fn prepared(&self) -> bool {
        self.state.prepared()
    }

    pub fn done(&self) -> bool {
        self.state.done()
    }

    pub fn finished(&self) -> bool {
        self.state.finished()
    }

    pub fn result(&self) -> Option<&T> {
        self.state.result()
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn executions(&self) -> u32 {
        self.executions
    }

    /// Move back without counting an external reset.
    fn rewind(&mut self, rewind: Rewind) {
        self.state = match (rewind, std::mem::replace(&mut self.state, StageState::Unprepared)) {
            (Rewind::Prepare, _) | (Rewind::Execute, StageState::Unprepared) => StageState::Unprepared,
            (Rewind::Execute, _) => StageState::Prepared,
        };
    }

    pub fn snapshot(&self, stage: StageId, sweep: Option<SweepKey>) -> StageSnapshot {
        StageSnapshot {
            stage,
            sweep,
            status: self.state.status(),
            prepared: self.prepared(),
            done: self.done(),
            finished: self.finished(),
            resets: self.resets,
            executions: self.executions,
        }
    }
}

/// Drives one stage through its lifecycle.
pub struct StageController<S: Stage> {
    stage: S,
    record: StageRecord<S::Output>,
    max_retries: u32,
}

impl<S: Stage> StageController<S> {
    pub fn new(stage: S, max_retries: u32) -> Self {
        Self {
            stage,
            record: StageRecord::default(),
            max_retries,
        }
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut S {
        &mut self.stage
    }

    pub fn record(&self) -> &StageRecord<S::Output> {
        &self.record
    }

    pub fn snapshot(&self) -> StageSnapshot {
        self.record
            .snapshot(self.stage.id(), self.stage.sweep().cloned())
    }

    /// Force the stage back to UNPREPARED and drop its result.
    pub fn reset(&mut self) {
        if self.record.prepared() {
            debug!(stage = %self.stage.id(), sweep = ?self.stage.sweep(), "Stage reset");
        }
        self.record.rewind(Rewind::Prepare);
        self.record.resets += 1;
    }

    /// Mark the stage not-done so its next request re-executes it.
    pub fn invalidate(&mut self, rewind: Rewind) {
        self.record.rewind(rewind);
    }

    /// Drive the stage to FINISHED and return a copy of its result.
    ///
    /// Re-entrant: a finished stage returns immediately.
    pub fn get_result(&mut self, ctx: &mut S::Context) -> Result<S::Output> {
        self.drive(ctx)?;
        self.record
            .result()
            .cloned()
            .ok_or_else(|| ReductionError::Internal("finished stage has no result".to_string()))
    }

    /// Drive the stage to FINISHED.
    pub fn drive(&mut self, ctx: &mut S::Context) -> Result<()> {
        let id = self.stage.id();
        let mut retries = 0u32;

        loop {
            let stage = &mut self.stage;
            let record = &mut self.record;
            let step = match &mut record.state {
                StageState::Finished(_) => return Ok(()),
                StageState::Unprepared => match stage.prepare(ctx) {
                    Ok(Step::Advance(())) => {
                        record.state = StageState::Prepared;
                        None
                    }
                    Ok(Step::Retry(retry)) => Some(retry),
                    Err(e) => return Err(wrap(id, stage.sweep(), e)),
                },
                StageState::Prepared => match stage.execute(ctx) {
                    Ok(Step::Advance(output)) => {
                        record.state = StageState::Done(output);
                        record.executions += 1;
                        None
                    }
                    Ok(Step::Retry(retry)) => Some(retry),
                    Err(e) => return Err(wrap(id, stage.sweep(), e)),
                },
                StageState::Done(output) => match stage.finish(ctx, output) {
                    Ok(Step::Advance(())) => {
                        if let StageState::Done(output) =
                            std::mem::replace(&mut record.state, StageState::Unprepared)
                        {
                            record.state = StageState::Finished(output);
                        }
                        debug!(stage = %id, sweep = ?stage.sweep(), "Stage finished");
                        None
                    }
                    Ok(Step::Retry(retry)) => Some(retry),
                    Err(e) => return Err(wrap(id, stage.sweep(), e)),
                },
            };

            if let Some(retry) = step {
                retries += 1;
                if retries > self.max_retries {
                    warn!(stage = %id, sweep = ?self.stage.sweep(), retries, "Stage did not converge");
                    return Err(ReductionError::stage(
                        id,
                        self.stage.sweep().cloned(),
                        ReductionError::FailedToConverge {
                            stage: id,
                            attempts: retries,
                        },
                    ));
                }
                debug!(
                    stage = %id,
                    sweep = ?self.stage.sweep(),
                    rewind = ?retry.rewind,
                    reason = %retry.reason,
                    attempt = retries,
                    "Stage requested retry"
                );
                // A retry from prepare itself simply re-runs prepare.
                self.record.rewind(retry.rewind);
            }
        }
    }
}

fn wrap(stage: StageId, sweep: Option<&SweepKey>, error: ReductionError) -> ReductionError {
    ReductionError::stage(stage, sweep.cloned(), error)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted stage: each phase pops its next outcome from a queue.
    #[derive(Default)]
    struct Scripted {
        prepare: Vec<Result<Step<()>>>,
        execute: Vec<Result<Step<u32>>>,
        finish: Vec<Result<Step<()>>>,
        calls: Vec<&'static str>,
    }

    impl Stage for Scripted {
        type Context = Vec<StageStatus>;
        type Output = u32;

        fn id(&self) -> StageId {
            StageId::Integration
        }

        fn prepare(&mut self, _ctx: &mut Self::Context) -> Result<Step<()>> {
            self.calls.push("prepare");
            if self.prepare.is_empty() {
                Ok(Step::Advance(()))
            } else {
                self.prepare.remove(0)
            }
        }

        fn execute(&mut self, _ctx: &mut Self::Context) -> Result<Step<u32>> {
            self.calls.push("execute");
            if self.execute.is_empty() {
                Ok(Step::Advance(42))
            } else {
                self.execute.remove(0)
            }
        }

        fn finish(&mut self, _ctx: &mut Self::Context, output: &mut u32) -> Result<Step<()>> {
            self.calls.push("finish");
            *output += 1;
            if self.finish.is_empty() {
                Ok(Step::Advance(()))
            } else {
                self.finish.remove(0)
            }
        }
    }

    fn assert_invariant<T>(record: &StageRecord<T>) {
        if record.finished() {
            assert!(record.done());
        }
        if record.done() {
            assert!(record.prepared());
            assert!(record.result().is_some());
        } else {
            assert!(record.result().is_none());
        }
    }

    #[test]
    fn test_happy_path_runs_each_phase_once() {
        let mut controller = StageController::new(Scripted::default(), 3);
        let mut ctx = Vec::new();
        assert_eq!(controller.get_result(&mut ctx).unwrap(), 43);
        assert_eq!(controller.stage().calls, vec!["prepare", "execute", "finish"]);
        assert_invariant(controller.record());

        // Re-entrant: no further phases run.
        assert_eq!(controller.get_result(&mut ctx).unwrap(), 43);
        assert_eq!(controller.stage().calls.len(), 3);
    }

    #[test]
    fn test_execute_can_request_more_preparation() {
        let stage = Scripted {
            execute: vec![Ok(Step::retry_prepare("parameter changed"))],
            ..Default::default()
        };
        let mut controller = StageController::new(stage, 3);
        controller.get_result(&mut Vec::new()).unwrap();
        assert_eq!(
            controller.stage().calls,
            vec!["prepare", "execute", "prepare", "execute", "finish"]
        );
    }

    #[test]
    fn test_finish_can_force_reexecution() {
        let stage = Scripted {
            finish: vec![Ok(Step::retry_execute("limit moved"))],
            ..Default::default()
        };
        let mut controller = StageController::new(stage, 3);
        assert_eq!(controller.get_result(&mut Vec::new()).unwrap(), 43);
        assert_eq!(
            controller.stage().calls,
            vec!["prepare", "execute", "finish", "execute", "finish"]
        );
        assert_eq!(controller.record().executions(), 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut controller = StageController::new(Scripted::default(), 3);
        controller.get_result(&mut Vec::new()).unwrap();
        controller.reset();

        let record = controller.record();
        assert!(!record.prepared() && !record.done() && !record.finished());
        assert!(record.result().is_none());
        assert_eq!(record.resets(), 1);

        controller.get_result(&mut Vec::new()).unwrap();
        assert_eq!(controller.stage().calls.len(), 6);
    }

    #[test]
    fn test_error_leaves_state_for_inspection() {
        let stage = Scripted {
            execute: vec![Err(ReductionError::InsufficientData("empty".to_string()))],
            ..Default::default()
        };
        let mut controller = StageController::new(stage, 3);
        let err = controller.get_result(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            ReductionError::StageFailure {
                stage: StageId::Integration,
                ..
            }
        ));
        assert_eq!(controller.record().state().status(), StageStatus::Prepared);
        assert_invariant(controller.record());

        // Caller may retry; the scripted failure is consumed.
        assert_eq!(controller.get_result(&mut Vec::new()).unwrap(), 43);
    }

    #[test]
    fn test_retry_ceiling() {
        let stage = Scripted {
            finish: (0..10).map(|_| Ok(Step::retry_execute("again"))).collect(),
            ..Default::default()
        };
        let mut controller = StageController::new(stage, 2);
        let err = controller.get_result(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            ReductionError::FailedToConverge { attempts: 3, .. }
        ));
        assert!(!controller.record().finished());
        assert_invariant(controller.record());
    }

    #[test]
    fn test_invariant_holds_after_every_transition() {
        let stage = Scripted {
            prepare: vec![Ok(Step::retry_prepare("upstream reset"))],
            execute: vec![Ok(Step::retry_prepare("more input"))],
            finish: vec![Ok(Step::retry_execute("redo"))],
            ..Default::default()
        };
        let mut controller = StageController::new(stage, 10);

        // Walk manually through invalidations as an external caller would.
        controller.get_result(&mut Vec::new()).unwrap();
        assert_invariant(controller.record());
        controller.invalidate(Rewind::Execute);
        assert_invariant(controller.record());
        assert_eq!(controller.record().state().status(), StageStatus::Prepared);
        controller.invalidate(Rewind::Prepare);
        assert_invariant(controller.record());
        controller.get_result(&mut Vec::new()).unwrap();
        assert_invariant(controller.record());
    }
}
