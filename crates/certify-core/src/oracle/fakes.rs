//! Scripted oracle for tests.
//!
//! Responses are queued up front and consumed in call order; every call is
//! recorded so tests can assert exactly which steps were graded.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{GradingOracle, OracleError, OracleMode, Verdict};

/// One recorded oracle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleCall {
    pub mode: OracleMode,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Default)]
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<Result<Verdict, OracleError>>>,
    calls: Mutex<Vec<OracleCall>>,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, score: u8, reasoning: &str) {
        self.push(Ok(Verdict {
            score,
            reasoning: reasoning.to_string(),
        }));
    }

    pub fn push_err(&self, message: &str) {
        self.push(Err(OracleError::Request(message.to_string())));
    }

    pub fn push(&self, response: Result<Verdict, OracleError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Questions asked so far, in order.
    pub fn questions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.question).collect()
    }

    async fn respond(&self, mode: OracleMode, question: &str, answer: &str) -> Result<Verdict, OracleError> {
        self.calls.lock().unwrap().push(OracleCall {
            mode,
            question: question.to_string(),
            answer: answer.to_string(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Request("no scripted response".to_string())))
    }
}

#[async_trait]
impl GradingOracle for ScriptedOracle {
    async fn evaluate(&self, question: &str, answer: &str) -> Result<Verdict, OracleError> {
        self.respond(OracleMode::Evaluate, question, answer).await
    }

    async fn re_evaluate(&self, question: &str, answer: &str) -> Result<Verdict, OracleError> {
        self.respond(OracleMode::Blind, question, answer).await
    }
}
