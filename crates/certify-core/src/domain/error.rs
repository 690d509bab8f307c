//! Domain-level error taxonomy for the grading core.

use certify_state::{ModelError, StorageError};

use crate::config::ConfigError;
use crate::oracle::OracleError;

/// Rejected operator input. Always raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("a human review requires a non-empty note")]
    EmptyNote,

    #[error("score {score} is outside 0..=100")]
    ScoreOutOfRange { score: u32 },

    #[error("entry index {index} out of range (step has {len} entries)")]
    EntryOutOfRange { index: usize, len: usize },

    #[error("step not found: {step_id}")]
    StepNotFound { step_id: String },

    #[error("step {step_id} is not a graded system step")]
    StepNotGradable { step_id: String },
}

/// Grading core errors.
#[derive(Debug, thiserror::Error)]
pub enum CertifyError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("run {run_id} is certified; grading is read-only")]
    RunCertified { run_id: String },

    #[error("run {run_id} is not eligible for certification (status {status})")]
    NotEligible { run_id: String, status: String },

    #[error("a regrade is already active for run {run_id}")]
    RegradeActive { run_id: String },

    #[error("no failed regrade to retry")]
    NoFailedRegrade,

    #[error("no regrade snapshot to discard")]
    NothingToDiscard,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("model invariant violated: {0}")]
    Model(#[from] ModelError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for grading core operations.
pub type Result<T> = std::result::Result<T, CertifyError>;
