//! Grading workflow: election protocol, re-grade orchestrator and
//! certification gate.

pub mod certification;
pub mod election;
pub mod regrade;

pub use certification::{is_eligible, CertificationGate};
pub use election::{GradeOutcome, Grader};
pub use regrade::{
    CancellationToken, DiscardOutcome, RegradeConfig, RegradeFailure, RegradeOrchestrator,
    RegradeOutcome, RegradePhase, RegradeProgress, StepMark,
};
