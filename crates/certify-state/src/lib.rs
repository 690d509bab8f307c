//! Certify-State: grading data model and SurrealDB persistence
//!
//! This crate provides the persistence layer for the agent certification
//! console: the Run / Step / GradeEntry / Certificate data model, the
//! `RunStore` persistence contract, an in-memory fake for tests and a
//! SurrealDB-backed implementation.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: data-model invariants, durable step/run saves, single issuance of
//! certificates.
//!
//! ## Key Components
//!
//! - `model`: `Run`, `Step`, `GradeEntry`, `Certificate` and their invariants
//! - `RunStore`: async persistence contract used by the grading core
//! - `SurrealRunStore`: SurrealDB implementation of `RunStore`

mod error;
pub mod fakes;
pub mod handle;
mod migrations;
pub mod model;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::CloudConfig;
pub use model::{
    Certificate, GradeEntry, GradeSource, ModelError, Run, RunId, RunStatus, Step, StepId,
    StepRole, DEFAULT_PASS_THRESHOLD, SCORE_MAX,
};
pub use storage_traits::{ContentDigest, RunPatch, RunStore, StepPatch, StorageResult};
pub use surreal_store::SurrealRunStore;

/// Result type for certify-state operations
pub type Result<T> = std::result::Result<T, StateError>;
