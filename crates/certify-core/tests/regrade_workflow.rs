//! Regrade orchestrator tests: sequential replay, failure capture, resume at
//! the failed position, snapshot discard, cancellation and progress.

use std::sync::Arc;
use std::time::Duration;

use certify_core::oracle::fakes::ScriptedOracle;
use certify_core::{
    CancellationToken, Certificate, CertifyError, GradeSource, Grader, OracleError, OracleMode,
    RegradeConfig, RegradeOrchestrator, RegradeOutcome, RegradePhase, Run, RunStatus, Step,
    StepId, StepMark,
};
use certify_state::fakes::MemoryRunStore;
use certify_state::RunStore;

fn fast() -> RegradeConfig {
    RegradeConfig {
        mode: OracleMode::Evaluate,
        throttle: Duration::ZERO,
        oracle_timeout: Duration::from_secs(5),
    }
}

/// Three question/answer/verdict triples; verdict ids are v1..v3.
fn three_step_run() -> Run {
    let mut run = Run::new("agent-1", "Agent One");
    for (i, score) in [(1, 80u8), (2, 70), (3, 90)] {
        run.push_step(Step::interviewer(format!("q{i}")).with_id(&format!("q{i}")))
            .unwrap();
        run.push_step(Step::agent(format!("a{i}")).with_id(&format!("a{i}")))
            .unwrap();
        run.push_step(
            Step::graded(score, format!("orig{i}"))
                .unwrap()
                .with_id(&format!("v{i}")),
        )
        .unwrap();
    }
    run.resolve_verdict().unwrap();
    run
}

struct Harness {
    store: Arc<MemoryRunStore>,
    oracle: Arc<ScriptedOracle>,
    orchestrator: RegradeOrchestrator,
    run: Run,
}

async fn harness(run: Run, config: RegradeConfig) -> Harness {
    harness_with(run, ScriptedOracle::new(), config).await
}

async fn harness_with(run: Run, oracle: ScriptedOracle, config: RegradeConfig) -> Harness {
    let store = Arc::new(MemoryRunStore::new());
    store.create_run(&run).await.unwrap();
    let oracle = Arc::new(oracle);
    let orchestrator =
        RegradeOrchestrator::new(Grader::new(store.clone()), oracle.clone(), config);
    Harness {
        store,
        oracle,
        orchestrator,
        run,
    }
}

#[tokio::test]
async fn completes_in_transcript_order() {
    let mut h = harness(three_step_run(), fast()).await;
    h.oracle.push_ok(60, "new1");
    h.oracle.push_ok(65, "new2");
    h.oracle.push_ok(70, "new3");

    let token = CancellationToken::new();
    let outcome = h.orchestrator.start(&mut h.run, &token).await.unwrap();

    assert_eq!(outcome, RegradeOutcome::Completed);
    assert_eq!(h.orchestrator.phase(), RegradePhase::Completed);
    assert_eq!(h.oracle.questions(), vec!["q1", "q2", "q3"]);
    let answers: Vec<String> = h.oracle.calls().into_iter().map(|c| c.answer).collect();
    assert_eq!(answers, vec!["a1", "a2", "a3"]);

    for (index, content) in [(2, "new1"), (5, "new2"), (8, "new3")] {
        let step = &h.run.steps[index];
        assert_eq!(step.content, content);
        assert_eq!(step.grading_history().len(), 2);
        assert_eq!(step.elected_entry().unwrap().source(), GradeSource::Automated);
    }
    assert_eq!(h.run.score, Some(65));
    assert_eq!(h.run.status, RunStatus::Fail);

    let progress = h.orchestrator.progress();
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.current_step, None);
    assert_eq!(h.store.get_run(&h.run.id).await.unwrap(), h.run);
}

#[tokio::test]
async fn failure_stops_at_queue_position_and_retry_resumes() {
    let mut h = harness(three_step_run(), fast()).await;
    let before = h.run.clone();
    h.oracle.push_ok(60, "new1");
    h.oracle.push_err("grader unavailable");

    let token = CancellationToken::new();
    let outcome = h.orchestrator.start(&mut h.run, &token).await.unwrap();

    let RegradeOutcome::Failed(failure) = outcome else {
        panic!("expected a failed regrade");
    };
    assert_eq!(failure.queue_position, 1);
    assert_eq!(failure.step_id, StepId::from("v2"));
    assert!(failure.message.contains("grader unavailable"));
    assert_eq!(h.orchestrator.phase(), RegradePhase::Failed);

    assert_eq!(h.run.steps[2].grading_history().len(), 2);
    assert_eq!(h.run.steps[2].content, "new1");
    assert_eq!(h.run.steps[5], before.steps[5]);
    assert_eq!(h.run.steps[8], before.steps[8]);

    let progress = h.orchestrator.progress();
    assert_eq!(progress.phase, RegradePhase::Failed);
    assert_eq!(progress.percent, 33);
    assert_eq!(progress.failure.as_ref(), Some(&failure));

    h.oracle.push_ok(65, "new2");
    h.oracle.push_ok(70, "new3");
    let outcome = h.orchestrator.retry(&mut h.run, &token).await.unwrap();
    assert_eq!(outcome, RegradeOutcome::Completed);

    assert_eq!(h.oracle.questions(), vec!["q1", "q2", "q2", "q3"]);
    assert_eq!(h.run.steps[2].grading_history().len(), 2);
    assert_eq!(h.run.steps[5].content, "new2");
    assert_eq!(h.run.steps[8].content, "new3");
}

#[tokio::test]
async fn discard_restores_snapshot_exactly() {
    let mut run = three_step_run();
    run.steps[5] = Step::legacy_graded("legacy verdict", 72, false).with_id("v2");
    run.recompute_score();
    let mut h = harness(run, fast()).await;
    let before = h.run.clone();

    h.oracle.push_ok(10, "harsh");
    h.oracle.push_ok(20, "harsher");
    h.oracle.push_err("boom");

    let token = CancellationToken::new();
    let outcome = h.orchestrator.start(&mut h.run, &token).await.unwrap();
    assert!(matches!(outcome, RegradeOutcome::Failed(ref f) if f.queue_position == 2));
    assert_ne!(h.run, before);

    let discarded = h.orchestrator.discard(&mut h.run).await.unwrap();
    assert_eq!(discarded.restored_steps, 2);
    assert!(discarded.persisted);

    assert_eq!(h.run, before);
    assert!(h.run.steps[5].grading_history().is_empty());
    assert_eq!(h.store.get_run(&h.run.id).await.unwrap(), before);
    assert_eq!(h.orchestrator.phase(), RegradePhase::Idle);
    assert_eq!(h.orchestrator.progress().percent, 0);
    assert!(h.orchestrator.failure().is_none());
}

#[tokio::test]
async fn cancellation_halts_without_failing() {
    let mut h = harness(three_step_run(), fast()).await;
    let before = h.run.clone();
    let token = CancellationToken::new();
    token.cancel();

    let outcome = h.orchestrator.start(&mut h.run, &token).await.unwrap();
    assert_eq!(outcome, RegradeOutcome::Cancelled { position: 0 });
    assert_eq!(h.orchestrator.phase(), RegradePhase::Running);
    assert!(h.orchestrator.failure().is_none());
    assert!(h.oracle.calls().is_empty());

    let err = h
        .orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CertifyError::RegradeActive { .. }));

    let err = h
        .orchestrator
        .retry(&mut h.run, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CertifyError::NoFailedRegrade));

    h.orchestrator.discard(&mut h.run).await.unwrap();
    assert_eq!(h.run, before);
    assert_eq!(h.orchestrator.phase(), RegradePhase::Idle);
}

#[tokio::test]
async fn cancellation_observed_between_steps() {
    let oracle = ScriptedOracle::new().with_delay(Duration::from_millis(50));
    let mut h = harness_with(three_step_run(), oracle, fast()).await;
    for _ in 0..3 {
        h.oracle.push_ok(50, "mid");
    }
    let token = CancellationToken::new();
    let mut progress = h.orchestrator.subscribe();
    let canceller = token.clone();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if progress.borrow().processed >= 1 {
                canceller.cancel();
                break;
            }
        }
    });

    let outcome = h.orchestrator.start(&mut h.run, &token).await.unwrap();
    watcher.await.unwrap();

    let RegradeOutcome::Cancelled { position } = outcome else {
        panic!("expected a cancelled regrade");
    };
    assert!(position >= 1 && position < 3);
    assert_eq!(h.oracle.calls().len(), position);
}

#[tokio::test]
async fn lifecycle_errors() {
    let mut h = harness(three_step_run(), fast()).await;
    let token = CancellationToken::new();

    let err = h.orchestrator.retry(&mut h.run, &token).await.unwrap_err();
    assert!(matches!(err, CertifyError::NoFailedRegrade));
    let err = h.orchestrator.discard(&mut h.run).await.unwrap_err();
    assert!(matches!(err, CertifyError::NothingToDiscard));

    h.oracle.push_err("down");
    h.orchestrator.start(&mut h.run, &token).await.unwrap();
    let err = h.orchestrator.start(&mut h.run, &token).await.unwrap_err();
    assert!(matches!(err, CertifyError::RegradeActive { .. }));
    let err = h
        .orchestrator
        .regrade_step(&mut h.run, &"v1".into())
        .await
        .unwrap_err();
    assert!(matches!(err, CertifyError::RegradeActive { .. }));

    h.orchestrator.discard(&mut h.run).await.unwrap();
    let err = h.orchestrator.discard(&mut h.run).await.unwrap_err();
    assert!(matches!(err, CertifyError::NothingToDiscard));
}

#[tokio::test]
async fn completed_regrade_cannot_be_discarded_but_can_restart() {
    let mut h = harness(three_step_run(), fast()).await;
    let token = CancellationToken::new();
    for _ in 0..6 {
        h.oracle.push_ok(75, "again");
    }

    h.orchestrator.start(&mut h.run, &token).await.unwrap();
    let err = h.orchestrator.discard(&mut h.run).await.unwrap_err();
    assert!(matches!(err, CertifyError::NothingToDiscard));

    let outcome = h.orchestrator.start(&mut h.run, &token).await.unwrap();
    assert_eq!(outcome, RegradeOutcome::Completed);
    assert_eq!(h.run.steps[2].grading_history().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn oracle_timeout_is_a_failure() {
    let oracle = ScriptedOracle::new().with_delay(Duration::from_secs(120));
    let config = RegradeConfig {
        oracle_timeout: Duration::from_secs(60),
        ..fast()
    };
    let mut h = harness_with(three_step_run(), oracle, config).await;
    h.oracle.push_ok(50, "never delivered");

    let outcome = h
        .orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap();
    let RegradeOutcome::Failed(failure) = outcome else {
        panic!("expected a failed regrade");
    };
    assert_eq!(failure.queue_position, 0);
    assert!(failure
        .message
        .contains(&OracleError::Timeout(Duration::from_secs(60)).to_string()));
}

#[tokio::test(start_paused = true)]
async fn throttle_paces_consecutive_calls() {
    let config = RegradeConfig {
        throttle: Duration::from_millis(1500),
        ..fast()
    };
    let mut h = harness(three_step_run(), config).await;
    for _ in 0..3 {
        h.oracle.push_ok(80, "paced");
    }

    let started = tokio::time::Instant::now();
    h.orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(3000));
}

#[tokio::test]
async fn blind_mode_uses_re_evaluate() {
    let config = RegradeConfig {
        mode: OracleMode::Blind,
        ..fast()
    };
    let mut h = harness(three_step_run(), config).await;
    for _ in 0..3 {
        h.oracle.push_ok(80, "blind");
    }

    h.orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap();
    assert!(h.oracle.calls().iter().all(|c| c.mode == OracleMode::Blind));
}

#[tokio::test]
async fn step_marks_track_queue() {
    let mut h = harness(three_step_run(), fast()).await;
    h.oracle.push_ok(60, "new1");
    h.oracle.push_err("down");

    h.orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.orchestrator.mark(2), Some(StepMark::Processed));
    assert_eq!(h.orchestrator.mark(5), Some(StepMark::Pending));
    assert_eq!(h.orchestrator.mark(8), Some(StepMark::Pending));
    assert_eq!(h.orchestrator.mark(0), None);
}

#[tokio::test]
async fn empty_queue_completes_immediately() {
    let mut run = Run::new("agent-1", "Agent One");
    run.push_step(Step::interviewer("hello")).unwrap();
    let mut h = harness(run, fast()).await;

    let outcome = h
        .orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RegradeOutcome::Completed);
    assert_eq!(h.orchestrator.progress().percent, 100);
    assert!(h.oracle.calls().is_empty());
}

#[tokio::test]
async fn regrade_step_grades_one_step() {
    let mut h = harness(three_step_run(), fast()).await;
    h.oracle.push_ok(55, "single");

    let outcome = h
        .orchestrator
        .regrade_step(&mut h.run, &"v2".into())
        .await
        .unwrap();

    assert_eq!(outcome.entry_index, 1);
    assert_eq!(h.oracle.questions(), vec!["q2"]);
    assert_eq!(h.run.steps[5].content, "single");
    assert_eq!(h.run.steps[2].grading_history().len(), 1);
    assert_eq!(h.orchestrator.phase(), RegradePhase::Idle);
}

#[tokio::test]
async fn regrade_step_surfaces_oracle_error() {
    let mut h = harness(three_step_run(), fast()).await;
    h.oracle.push_err("down");
    let before = h.run.clone();

    let err = h
        .orchestrator
        .regrade_step(&mut h.run, &"v1".into())
        .await
        .unwrap_err();
    assert!(matches!(err, CertifyError::Oracle(_)));
    assert_eq!(h.run, before);
}

#[tokio::test]
async fn certified_run_cannot_be_regraded() {
    let mut run = three_step_run();
    run.certificate = Some(Certificate::for_run(&run, chrono::Utc::now()).unwrap());
    let mut h = harness(run, fast()).await;

    let err = h
        .orchestrator
        .start(&mut h.run, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CertifyError::RunCertified { .. }));
    assert!(h.oracle.calls().is_empty());
}

#[tokio::test]
async fn regrade_runs_on_spawned_task() {
    let Harness {
        store,
        oracle,
        mut orchestrator,
        mut run,
    } = harness(three_step_run(), fast()).await;
    oracle.push_ok(60, "new1");
    oracle.push_ok(65, "new2");
    oracle.push_ok(70, "new3");

    let task = tokio::spawn(async move {
        let token = CancellationToken::new();
        let outcome = orchestrator.start(&mut run, &token).await;
        (outcome, run)
    });
    let (outcome, run) = task.await.unwrap();

    assert_eq!(outcome.unwrap(), RegradeOutcome::Completed);
    assert_eq!(run.score, Some(65));
    assert_eq!(store.get_run(&run.id).await.unwrap().score, Some(65));
}
