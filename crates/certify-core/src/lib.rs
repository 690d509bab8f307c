//! Certify Core Library
//!
//! Grading logic for agent certification runs: reviews and elections over a
//! step's grade history, sequential automated re-grading with resumable
//! failure handling, and certificate issuance.
//!
//! ## Layer 1 - Domain
//!
//! The data model and the persistence contract come from `certify-state`;
//! this crate adds the protocols that mutate them and the grading-oracle
//! contract they call out to.

pub mod config;
pub mod domain;
pub mod grading;
pub mod metrics;
pub mod obs;
pub mod oracle;
pub mod telemetry;

pub use config::{ConfigError, GradingConfig};
pub use domain::{CertifyError, Result, ValidationError};
pub use grading::{
    is_eligible, CancellationToken, CertificationGate, DiscardOutcome, GradeOutcome, Grader,
    RegradeConfig, RegradeFailure, RegradeOrchestrator, RegradeOutcome, RegradePhase,
    RegradeProgress, StepMark,
};
pub use oracle::{GradingOracle, HttpGradingOracle, OracleError, OracleMode, Verdict};

pub use certify_state::{
    Certificate, GradeEntry, GradeSource, Run, RunId, RunStatus, RunStore, Step, StepId, StepRole,
};
