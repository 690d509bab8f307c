//! HTTP grading oracle.
//!
//! POSTs `{"question", "answer"}` as JSON to `<base>/evaluate` or
//! `<base>/re-evaluate` and expects `{"score", "reasoning"}` back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GradingOracle, OracleError, Verdict};

#[derive(Serialize)]
struct GradeRequest<'a> {
    question: &'a str,
    answer: &'a str,
}

#[derive(Deserialize)]
struct GradeResponse {
    score: i64,
    #[serde(default)]
    reasoning: String,
}

pub struct HttpGradingOracle {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpGradingOracle {
    pub fn new(base_url: impl Into<String>) -> Result<Self, OracleError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("certify-core/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(base_url, http_client))
    }

    pub fn with_client(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http_client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post(&self, path: &str, question: &str, answer: &str) -> Result<Verdict, OracleError> {
        let url = self.endpoint(path);
        debug!(url = %url, "calling grading oracle");

        let response = self
            .http_client
            .post(&url)
            .json(&GradeRequest { question, answer })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: GradeResponse = response.json().await?;
        Verdict::checked(body.score, body.reasoning)
    }
}

#[async_trait]
impl GradingOracle for HttpGradingOracle {
    async fn evaluate(&self, question: &str, answer: &str) -> Result<Verdict, OracleError> {
        self.post("evaluate", question, answer).await
    }

    async fn re_evaluate(&self, question: &str, answer: &str) -> Result<Verdict, OracleError> {
        self.post("re-evaluate", question, answer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_without_double_slash() {
        let oracle = HttpGradingOracle::new("http://grader.local/api/").unwrap();
        assert_eq!(oracle.base_url(), "http://grader.local/api");
        assert_eq!(oracle.endpoint("evaluate"), "http://grader.local/api/evaluate");
        assert_eq!(
            oracle.endpoint("re-evaluate"),
            "http://grader.local/api/re-evaluate"
        );
    }

    #[test]
    fn response_reasoning_defaults_to_empty() {
        let body: GradeResponse = serde_json::from_str(r#"{"score": 55}"#).unwrap();
        assert_eq!(body.score, 55);
        assert!(body.reasoning.is_empty());
    }

    #[tokio::test]
    async fn unreachable_oracle_is_request_error() {
        let oracle = HttpGradingOracle::new("http://127.0.0.1:9").unwrap();
        let err = oracle.evaluate("q", "a").await.unwrap_err();
        assert!(matches!(err, OracleError::Request(_)));
    }
}
