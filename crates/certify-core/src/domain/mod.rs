//! Domain error types for the grading core.
//!
//! The data model itself lives in `certify_state::model` so that the
//! persistence layer and the protocol logic share one definition.

pub mod error;

pub use error::{CertifyError, Result, ValidationError};
