//! Error types for certify-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

/// Errors returned by [`crate::storage_traits::RunStore`] implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("step {step_id} not found in run {run_id}")]
    StepNotFound { run_id: String, step_id: String },

    #[error("run {run_id} already exists")]
    DuplicateRun { run_id: String },

    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    #[error("run {run_id} already holds certificate {certificate_id}")]
    AlreadyCertified {
        run_id: String,
        certificate_id: String,
    },

    #[error("run {run_id} is certified and read-only for grading")]
    RunCertified { run_id: String },

    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
