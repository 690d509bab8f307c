//! Grading oracle contract.
//!
//! The oracle scores one question/answer pair. `evaluate` grades against the
//! template's expectations; `re_evaluate` is the blind variant used when the
//! operator wants a second opinion without the reference answer.

pub mod fakes;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use certify_state::SCORE_MAX;

pub use http::HttpGradingOracle;

/// Errors surfaced by oracle calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(String),

    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("oracle returned score {score}, expected 0..=100")]
    InvalidScore { score: i64 },

    #[error("oracle response could not be decoded: {0}")]
    Decode(String),

    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OracleError::Decode(err.to_string())
        } else {
            OracleError::Request(err.to_string())
        }
    }
}

/// Score and explanation for one question/answer pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub score: u8,
    pub reasoning: String,
}

impl Verdict {
    /// Validate a raw score as returned over the wire.
    pub fn checked(score: i64, reasoning: impl Into<String>) -> Result<Self, OracleError> {
        if !(0..=i64::from(SCORE_MAX)).contains(&score) {
            return Err(OracleError::InvalidScore { score });
        }
        Ok(Self {
            score: score as u8,
            reasoning: reasoning.into(),
        })
    }
}

/// Which oracle call a re-grade makes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleMode {
    #[default]
    Evaluate,
    Blind,
}

impl std::str::FromStr for OracleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evaluate" => Ok(OracleMode::Evaluate),
            "blind" | "re-evaluate" => Ok(OracleMode::Blind),
            other => Err(format!("unknown oracle mode {other:?} (expected evaluate or blind)")),
        }
    }
}

/// External grader.
#[async_trait]
pub trait GradingOracle: Send + Sync {
    async fn evaluate(&self, question: &str, answer: &str) -> Result<Verdict, OracleError>;

    /// Blind re-grade without a reference answer.
    async fn re_evaluate(&self, question: &str, answer: &str) -> Result<Verdict, OracleError>;
}

/// Dispatch on `mode` and bound the call by `timeout`.
pub async fn grade(
    oracle: &dyn GradingOracle,
    mode: OracleMode,
    question: &str,
    answer: &str,
    timeout: Duration,
) -> Result<Verdict, OracleError> {
    let call = async {
        match mode {
            OracleMode::Evaluate => oracle.evaluate(question, answer).await,
            OracleMode::Blind => oracle.re_evaluate(question, answer).await,
        }
    };
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(timeout)),
    }
}
