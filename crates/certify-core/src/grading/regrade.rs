//! Sequential re-grade orchestrator.
//!
//! Replays automated grading over every scoreable step of a run in
//! transcript order, one oracle call at a time.
//!
//! ```text
//! Idle ──start──▶ Running ──▶ Completed
//!                   │  ▲
//!            oracle │  │ retry (resumes at the failed position)
//!             error ▼  │
//!                  Failed ──discard──▶ Idle (steps restored from snapshot)
//! ```
//!
//! A cancelled loop halts in `Running` without entering `Failed`; a halted
//! regrade can only be discarded. The discard snapshot is taken once, at
//! `start`, and shared unchanged across retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use certify_state::{Run, RunId, RunStatus, Step, StepId};

use crate::config::{DEFAULT_ORACLE_TIMEOUT, DEFAULT_THROTTLE};
use crate::domain::{CertifyError, Result, ValidationError};
use crate::grading::election::{ensure_gradable, gradable_step, GradeOutcome, Grader};
use crate::metrics::METRICS;
use crate::obs;
use crate::oracle::{self, GradingOracle, OracleMode};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag, checked once per loop iteration.
///
/// Clones share the flag. An in-flight oracle or store call always completes
/// before cancellation is observed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegradePhase {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Where and why the last attempt stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegradeFailure {
    pub step_id: StepId,
    /// 0-based position in the scoreable-step queue.
    pub queue_position: usize,
    pub message: String,
}

/// Observable orchestrator state, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegradeProgress {
    pub phase: RegradePhase,
    /// Integer percentage of the queue processed.
    pub percent: u8,
    pub current_step: Option<StepId>,
    pub processed: usize,
    pub total: usize,
    pub failure: Option<RegradeFailure>,
}

impl RegradeProgress {
    fn idle() -> Self {
        Self {
            phase: RegradePhase::Idle,
            percent: 0,
            current_step: None,
            processed: 0,
            total: 0,
            failure: None,
        }
    }
}

/// How a `start` or `retry` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegradeOutcome {
    Completed,
    Failed(RegradeFailure),
    /// Halted by the cancellation token before grading `position`.
    Cancelled { position: usize },
}

/// Per-step rendering hint while a regrade is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMark {
    Processed,
    Current,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegradeConfig {
    pub mode: OracleMode,
    /// Pause between consecutive oracle calls.
    pub throttle: Duration,
    /// Upper bound on each oracle call.
    pub oracle_timeout: Duration,
}

impl Default for RegradeConfig {
    fn default() -> Self {
        Self {
            mode: OracleMode::Evaluate,
            throttle: DEFAULT_THROTTLE,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }
}

/// Immutable copy of everything a discard restores.
#[derive(Debug)]
struct RunSnapshot {
    steps: Arc<[Step]>,
    score: Option<u8>,
    status: RunStatus,
}

#[derive(Debug)]
struct ActiveRegrade {
    run_id: RunId,
    snapshot: RunSnapshot,
    /// Step indices, in transcript order.
    queue: Vec<usize>,
    /// Queue position the next attempt starts from.
    next: usize,
}

/// Result of a discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardOutcome {
    pub restored_steps: usize,
    pub persisted: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct RegradeOrchestrator {
    grader: Grader,
    oracle: Arc<dyn GradingOracle>,
    config: RegradeConfig,
    phase: RegradePhase,
    active: Option<ActiveRegrade>,
    current: Option<StepId>,
    failure: Option<RegradeFailure>,
    progress_tx: watch::Sender<RegradeProgress>,
}

impl RegradeOrchestrator {
    pub fn new(grader: Grader, oracle: Arc<dyn GradingOracle>, config: RegradeConfig) -> Self {
        let (progress_tx, _) = watch::channel(RegradeProgress::idle());
        Self {
            grader,
            oracle,
            config,
            phase: RegradePhase::Idle,
            active: None,
            current: None,
            failure: None,
            progress_tx,
        }
    }

    pub fn phase(&self) -> RegradePhase {
        self.phase
    }

    pub fn failure(&self) -> Option<&RegradeFailure> {
        self.failure.as_ref()
    }

    /// Latest published progress.
    pub fn progress(&self) -> RegradeProgress {
        self.progress_tx.borrow().clone()
    }

    /// Receive every progress update from now on.
    pub fn subscribe(&self) -> watch::Receiver<RegradeProgress> {
        self.progress_tx.subscribe()
    }

    /// Whether a regrade holds the run (running, halted or failed).
    pub fn is_active(&self) -> bool {
        matches!(self.phase, RegradePhase::Running | RegradePhase::Failed)
    }

    /// Rendering hint for the step at `step_index`, if it is queued.
    pub fn mark(&self, step_index: usize) -> Option<StepMark> {
        let active = self.active.as_ref()?;
        let position = active.queue.iter().position(|&i| i == step_index)?;
        if position < active.next {
            Some(StepMark::Processed)
        } else if position == active.next && self.current.is_some() {
            Some(StepMark::Current)
        } else {
            Some(StepMark::Pending)
        }
    }

    /// Snapshot the run and regrade every scoreable step from the start.
    pub async fn start(&mut self, run: &mut Run, token: &CancellationToken) -> Result<RegradeOutcome> {
        ensure_gradable(run)?;
        if self.is_active() {
            return Err(CertifyError::RegradeActive {
                run_id: run.id.0.clone(),
            });
        }

        self.active = Some(ActiveRegrade {
            run_id: run.id.clone(),
            snapshot: RunSnapshot {
                steps: Arc::from(run.steps.as_slice()),
                score: run.score,
                status: run.status,
            },
            queue: run.scoreable_indices(),
            next: 0,
        });
        self.failure = None;
        self.execute(run, token).await
    }

    /// Resume a failed regrade at the position that failed.
    pub async fn retry(&mut self, run: &mut Run, token: &CancellationToken) -> Result<RegradeOutcome> {
        ensure_gradable(run)?;
        let same_run = self.active.as_ref().is_some_and(|a| a.run_id == run.id);
        if self.phase != RegradePhase::Failed || !same_run {
            return Err(CertifyError::NoFailedRegrade);
        }
        self.failure = None;
        self.execute(run, token).await
    }

    /// Restore the run to its pre-regrade snapshot and return to `Idle`.
    pub async fn discard(&mut self, run: &mut Run) -> Result<DiscardOutcome> {
        ensure_gradable(run)?;
        let same_run = self.active.as_ref().is_some_and(|a| a.run_id == run.id);
        if !self.is_active() || !same_run {
            return Err(CertifyError::NothingToDiscard);
        }
        let Some(active) = self.active.take() else {
            return Err(CertifyError::NothingToDiscard);
        };

        let changed: Vec<usize> = active
            .snapshot
            .steps
            .iter()
            .enumerate()
            .filter(|(i, step)| run.steps.get(*i) != Some(*step))
            .map(|(i, _)| i)
            .collect();

        run.steps = active.snapshot.steps.to_vec();
        run.score = active.snapshot.score;
        run.status = active.snapshot.status;

        let mut persisted = true;
        for &index in &changed {
            persisted &= self.grader.save_step(run, index).await;
        }
        persisted &= self.grader.save_run(run).await;

        self.phase = RegradePhase::Idle;
        self.current = None;
        self.failure = None;
        self.publish(RegradeProgress::idle());
        obs::emit_regrade_discarded(&run.id.0, changed.len());

        Ok(DiscardOutcome {
            restored_steps: changed.len(),
            persisted,
        })
    }

    /// Re-grade a single step outside of a full regrade.
    pub async fn regrade_step(&self, run: &mut Run, step_id: &StepId) -> Result<GradeOutcome> {
        ensure_gradable(run)?;
        if self.is_active() {
            return Err(CertifyError::RegradeActive {
                run_id: run.id.0.clone(),
            });
        }
        let index = gradable_step(run, step_id)?;
        if !run.steps[index].is_scoreable() {
            return Err(ValidationError::StepNotGradable {
                step_id: step_id.0.clone(),
            }
            .into());
        }

        let (question, answer) = prompt_for(run, index);
        METRICS.inc_oracle_calls();
        let verdict = oracle::grade(
            self.oracle.as_ref(),
            self.config.mode,
            &question,
            &answer,
            self.config.oracle_timeout,
        )
        .await
        .inspect_err(|_| METRICS.inc_oracle_failures())?;

        self.grader
            .add_automated_review(run, step_id, u32::from(verdict.score), &verdict.reasoning)
            .await
    }

    #[tracing::instrument(name = "certify.run", skip_all, fields(run_id = %run.id))]
    async fn execute(&mut self, run: &mut Run, token: &CancellationToken) -> Result<RegradeOutcome> {
        let (queue, resume_at) = match &self.active {
            Some(active) => (active.queue.clone(), active.next),
            None => return Err(CertifyError::NoFailedRegrade),
        };
        let total = queue.len();

        self.phase = RegradePhase::Running;
        self.current = None;
        obs::emit_regrade_started(&run.id.0, total, resume_at);
        self.publish_state(resume_at, total);

        for (position, &step_index) in queue.iter().enumerate().skip(resume_at) {
            if position > resume_at && !self.config.throttle.is_zero() {
                tokio::time::sleep(self.config.throttle).await;
            }
            if token.is_cancelled() {
                self.current = None;
                self.publish_state(position, total);
                obs::emit_regrade_cancelled(&run.id.0, position);
                return Ok(RegradeOutcome::Cancelled { position });
            }

            let step_id = run.steps[step_index].id.clone();
            self.current = Some(step_id.clone());
            self.publish_state(position, total);

            let (question, answer) = prompt_for(run, step_index);
            METRICS.inc_oracle_calls();
            let graded = match oracle::grade(
                self.oracle.as_ref(),
                self.config.mode,
                &question,
                &answer,
                self.config.oracle_timeout,
            )
            .await
            {
                Ok(verdict) => self
                    .grader
                    .add_automated_review(run, &step_id, u32::from(verdict.score), &verdict.reasoning)
                    .await
                    .map(|_| verdict.score),
                Err(e) => {
                    METRICS.inc_oracle_failures();
                    Err(e.into())
                }
            };

            match graded {
                Ok(score) => {
                    if let Some(active) = self.active.as_mut() {
                        active.next = position + 1;
                    }
                    self.current = None;
                    self.publish_state(position + 1, total);
                    let percent = percent(position + 1, total);
                    obs::emit_regrade_step_graded(&run.id.0, &step_id.0, position, score, percent);
                }
                Err(e) => {
                    let failure = RegradeFailure {
                        step_id: step_id.clone(),
                        queue_position: position,
                        message: e.to_string(),
                    };
                    obs::emit_regrade_failed(&run.id.0, &step_id.0, position, &e);
                    self.phase = RegradePhase::Failed;
                    self.current = None;
                    self.failure = Some(failure.clone());
                    self.publish_state(position, total);
                    return Ok(RegradeOutcome::Failed(failure));
                }
            }
        }

        self.phase = RegradePhase::Completed;
        self.current = None;
        self.active = None;
        self.publish(RegradeProgress {
            phase: RegradePhase::Completed,
            percent: 100,
            current_step: None,
            processed: total,
            total,
            failure: None,
        });
        obs::emit_regrade_completed(&run.id.0, total, run.score);
        METRICS.flush();
        Ok(RegradeOutcome::Completed)
    }

    fn publish_state(&self, processed: usize, total: usize) {
        self.publish(RegradeProgress {
            phase: self.phase,
            percent: percent(processed, total),
            current_step: self.current.clone(),
            processed,
            total,
            failure: self.failure.clone(),
        });
    }

    fn publish(&self, progress: RegradeProgress) {
        self.progress_tx.send_replace(progress);
    }
}

/// Integer share of the queue processed. An empty queue counts as done.
fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((processed.min(total) * 100) / total) as u8
}

/// Nearest preceding question and answer text; missing ones are empty.
fn prompt_for(run: &Run, index: usize) -> (String, String) {
    let (question, answer) = run.question_and_answer(index);
    (
        question.map(|s| s.content.clone()).unwrap_or_default(),
        answer.map(|s| s.content.clone()).unwrap_or_default(),
    )
}
