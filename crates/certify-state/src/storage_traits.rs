//! Storage trait definitions for the certification console
//!
//! `RunStore` is the persistence collaborator the grading core talks to:
//! it loads and records runs, saves a step's grading fields, saves the
//! run-level verdict, and issues certificates.
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in the
//! `fakes` module; `SurrealRunStore` is the durable implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::model::{Certificate, GradeEntry, Run, RunId, RunStatus, Step, StepId};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// Grading fields of one step, saved as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPatch {
    pub grading_history: Vec<GradeEntry>,
    pub content: String,
    pub score: Option<u8>,
    pub is_human_graded: bool,
}

impl StepPatch {
    pub fn from_step(step: &Step) -> Self {
        Self {
            grading_history: step.grading_history().to_vec(),
            content: step.content.clone(),
            score: step.score,
            is_human_graded: step.is_human_graded,
        }
    }
}

/// Run-level verdict fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPatch {
    pub status: RunStatus,
    pub score: Option<u8>,
}

impl RunPatch {
    pub fn from_run(run: &Run) -> Self {
        Self {
            status: run.status,
            score: run.score,
        }
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// Evaluation run persistence.
///
/// Guarantees:
/// - Steps are only appended while the run is `running`.
/// - Grading writes (`update_step`, `update_run`) are refused once the run
///   carries a certificate.
/// - `issue_certificate` succeeds at most once per run, and only for runs
///   whose status is `pass`.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Record a new run. Fails with `DuplicateRun` if the ID is taken.
    async fn create_run(&self, run: &Run) -> StorageResult<()>;

    /// Retrieve a run with all of its steps.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<Run>;

    /// List runs newest first, optionally restricted to one agent.
    async fn list_runs(&self, agent_id: Option<&str>) -> StorageResult<Vec<Run>>;

    /// Append a transcript step to a running run.
    async fn append_step(&self, run_id: &RunId, step: &Step) -> StorageResult<()>;

    /// Save a step's grading history, content and mirrored score.
    async fn update_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        patch: StepPatch,
    ) -> StorageResult<()>;

    /// Save the run's status and average score.
    async fn update_run(&self, run_id: &RunId, patch: RunPatch) -> StorageResult<()>;

    /// Create a certificate bound to the run and attach it.
    async fn issue_certificate(&self, run_id: &RunId) -> StorageResult<Certificate>;
}
