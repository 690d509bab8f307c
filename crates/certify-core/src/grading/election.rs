//! Grade election protocol.
//!
//! Every operation validates its input first, then mutates the in-memory
//! run, then asks the store to save the step and the run-level verdict. The
//! in-memory run is authoritative: a failed save is logged and reported in
//! [`GradeOutcome::persisted`], never rolled back.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use certify_state::{
    GradeEntry, GradeSource, Run, RunPatch, RunStatus, RunStore, StepId, StepPatch, StepRole,
    SCORE_MAX,
};

use crate::domain::{CertifyError, Result, ValidationError};
use crate::metrics::METRICS;
use crate::obs;

/// Result of a successful election-protocol call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradeOutcome {
    /// Index of the elected entry in the step's grading history.
    pub entry_index: usize,
    /// Run score after the change.
    pub run_score: Option<u8>,
    pub run_status: RunStatus,
    /// Whether both the step and the run were saved.
    pub persisted: bool,
}

/// Applies reviews and elections to runs and persists them.
#[derive(Clone)]
pub struct Grader {
    store: Arc<dyn RunStore>,
}

impl Grader {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Append a human review and elect it. `note` must not be blank.
    pub async fn add_human_review(
        &self,
        run: &mut Run,
        step_id: &StepId,
        score: u32,
        note: &str,
    ) -> Result<GradeOutcome> {
        if note.trim().is_empty() {
            return Err(ValidationError::EmptyNote.into());
        }
        self.record_review(run, step_id, GradeSource::Human, score, note)
            .await
    }

    /// Append an automated review and elect it.
    pub async fn add_automated_review(
        &self,
        run: &mut Run,
        step_id: &StepId,
        score: u32,
        reasoning: &str,
    ) -> Result<GradeOutcome> {
        self.record_review(run, step_id, GradeSource::Automated, score, reasoning)
            .await
    }

    /// Elect the entry at `entry_index` (as listed by `Step::entries`).
    ///
    /// Re-electing the current entry is allowed and refreshes `elected_at`.
    pub async fn elect(
        &self,
        run: &mut Run,
        step_id: &StepId,
        entry_index: usize,
    ) -> Result<GradeOutcome> {
        ensure_gradable(run)?;
        let index = gradable_step(run, step_id)?;
        let len = run.steps[index].entries().len();
        if len == 0 {
            return Err(ValidationError::StepNotGradable {
                step_id: step_id.0.clone(),
            }
            .into());
        }
        if entry_index >= len {
            return Err(ValidationError::EntryOutOfRange {
                index: entry_index,
                len,
            }
            .into());
        }

        let step = &mut run.steps[index];
        step.elect_entry(entry_index, Utc::now())?;
        let score = step.score.unwrap_or_default();
        run.recompute_score();
        run.refresh_verdict();

        METRICS.inc_elections();
        obs::emit_entry_elected(&run.id.0, &step_id.0, entry_index, score);

        let persisted = self.persist(run, index).await;
        Ok(outcome(run, entry_index, persisted))
    }

    async fn record_review(
        &self,
        run: &mut Run,
        step_id: &StepId,
        source: GradeSource,
        score: u32,
        reasoning: &str,
    ) -> Result<GradeOutcome> {
        ensure_gradable(run)?;
        let index = gradable_step(run, step_id)?;
        let score = u8::try_from(score)
            .ok()
            .filter(|s| *s <= SCORE_MAX)
            .ok_or(ValidationError::ScoreOutOfRange { score })?;

        let now = Utc::now();
        let entry = GradeEntry::new(source, score, reasoning, now)?;
        let step = &mut run.steps[index];
        let entry_index = step.push_entry(entry);
        step.elect_entry(entry_index, now)?;
        run.recompute_score();
        run.refresh_verdict();

        METRICS.inc_reviews();
        obs::emit_review_recorded(&run.id.0, &step_id.0, source.as_str(), score, entry_index);

        let persisted = self.persist(run, index).await;
        Ok(outcome(run, entry_index, persisted))
    }

    /// Save the step at `index`, then the run verdict. Both are attempted.
    pub(crate) async fn persist(&self, run: &Run, index: usize) -> bool {
        let step = &run.steps[index];
        let step_saved = self.save_step(run, index).await;
        debug!(run_id = %run.id, step_id = %step.id, step_saved, "step persisted");
        let run_saved = self.save_run(run).await;
        step_saved && run_saved
    }

    pub(crate) async fn save_step(&self, run: &Run, index: usize) -> bool {
        let step = &run.steps[index];
        match self
            .store
            .update_step(&run.id, &step.id, StepPatch::from_step(step))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                METRICS.inc_persist_failures();
                obs::emit_persist_failed(&run.id.0, &format!("step:{}", step.id), &e);
                false
            }
        }
    }

    pub(crate) async fn save_run(&self, run: &Run) -> bool {
        match self.store.update_run(&run.id, RunPatch::from_run(run)).await {
            Ok(()) => true,
            Err(e) => {
                METRICS.inc_persist_failures();
                obs::emit_persist_failed(&run.id.0, "run", &e);
                false
            }
        }
    }
}

fn outcome(run: &Run, entry_index: usize, persisted: bool) -> GradeOutcome {
    GradeOutcome {
        entry_index,
        run_score: run.score,
        run_status: run.status,
        persisted,
    }
}

/// Refuse grading on certified runs.
pub(crate) fn ensure_gradable(run: &Run) -> Result<()> {
    if run.is_certified() {
        return Err(CertifyError::RunCertified {
            run_id: run.id.0.clone(),
        });
    }
    Ok(())
}

/// Locate a system step by id.
pub(crate) fn gradable_step(run: &Run, step_id: &StepId) -> Result<usize> {
    let index = run
        .step_index(step_id)
        .ok_or_else(|| ValidationError::StepNotFound {
            step_id: step_id.0.clone(),
        })?;
    if run.steps[index].role != StepRole::System {
        return Err(ValidationError::StepNotGradable {
            step_id: step_id.0.clone(),
        }
        .into());
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use certify_state::fakes::MemoryRunStore;
    use certify_state::Step;

    async fn setup() -> (Arc<MemoryRunStore>, Grader, Run) {
        let store = Arc::new(MemoryRunStore::new());
        let mut run = Run::new("agent-1", "Agent One");
        run.push_step(Step::interviewer("q").with_id("q1")).unwrap();
        run.push_step(Step::agent("a").with_id("a1")).unwrap();
        run.push_step(Step::graded(90, "solid").unwrap().with_id("v1"))
            .unwrap();
        run.resolve_verdict().unwrap();
        store.create_run(&run).await.unwrap();
        (store.clone(), Grader::new(store), run)
    }

    #[tokio::test]
    async fn blank_note_rejected_before_mutation() {
        let (store, grader, mut run) = setup().await;
        let before = run.clone();

        let err = grader
            .add_human_review(&mut run, &"v1".into(), 40, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, CertifyError::Validation(ValidationError::EmptyNote)));
        assert_eq!(run, before);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_score_rejected() {
        let (_, grader, mut run) = setup().await;
        let err = grader
            .add_human_review(&mut run, &"v1".into(), 101, "note")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CertifyError::Validation(ValidationError::ScoreOutOfRange { score: 101 })
        ));
        assert_eq!(run.steps[2].grading_history().len(), 1);
    }

    #[tokio::test]
    async fn non_system_step_rejected() {
        let (_, grader, mut run) = setup().await;
        let err = grader
            .add_automated_review(&mut run, &"a1".into(), 50, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CertifyError::Validation(ValidationError::StepNotGradable { .. })
        ));

        let err = grader
            .elect(&mut run, &"missing".into(), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CertifyError::Validation(ValidationError::StepNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn review_persists_step_then_run() {
        let (store, grader, mut run) = setup().await;
        let outcome = grader
            .add_automated_review(&mut run, &"v1".into(), 50, "weaker")
            .await
            .unwrap();

        assert_eq!(outcome.entry_index, 1);
        assert_eq!(outcome.run_score, Some(50));
        assert_eq!(outcome.run_status, RunStatus::Fail);
        assert!(outcome.persisted);

        let writes = store.writes();
        assert_eq!(writes.len(), 2);
        assert!(matches!(
            writes[0],
            certify_state::fakes::WriteRecord::Step { .. }
        ));
        assert_eq!(store.get_run(&run.id).await.unwrap(), run);
    }

    #[tokio::test]
    async fn elect_out_of_range() {
        let (_, grader, mut run) = setup().await;
        let err = grader.elect(&mut run, &"v1".into(), 5).await.unwrap_err();
        assert!(matches!(
            err,
            CertifyError::Validation(ValidationError::EntryOutOfRange { index: 5, len: 1 })
        ));
    }

    #[tokio::test]
    async fn persistence_failure_keeps_local_state() {
        let (store, grader, mut run) = setup().await;
        store.set_fail_writes(true);

        let outcome = grader
            .add_human_review(&mut run, &"v1".into(), 40, "too generous")
            .await
            .unwrap();

        assert!(!outcome.persisted);
        assert_eq!(run.steps[2].score, Some(40));
        assert_eq!(run.steps[2].grading_history().len(), 2);
        let stored = store.get_run(&run.id).await.unwrap();
        assert_eq!(stored.steps[2].score, Some(90));
    }
}
