//! Verification modes and the external verifier capability.
//!
//! # Design Principles
//! - AUTO tasks ask a verifier immediately after submission; MANUAL tasks go
//!   straight to moderation
//! - A verifier answer is only ever a pass or a fail; timeouts and transport
//!   errors are inconclusive and fall back to moderation, never to approval

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::task::Task;
use crate::ledger::UserId;

/// How completions of a task are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationMode {
    /// Ask the verifier capability on submission.
    Auto,
    /// Wait for the creator, a moderator or the auto-approval sweep.
    Manual,
}

impl VerificationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMode::Auto => "auto",
            VerificationMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(VerificationMode::Auto),
            "manual" => Some(VerificationMode::Manual),
            _ => None,
        }
    }
}

/// Answer of a verifier.
///
/// # Invariants
/// - `reason` always explains why the verification passed or failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub reason: String,
}

impl VerificationResult {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// What the state machine does with a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Passed(String),
    Failed(String),
    /// Timeout, transport error, or no verifier configured.
    Inconclusive(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier request failed: {0}")]
    Transport(String),

    #[error("verifier returned status {0}")]
    Status(u16),

    #[error("verifier response malformed: {0}")]
    Malformed(String),
}

/// External capability that checks a completion, e.g. a membership lookup.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify_completion(
        &self,
        executor_id: &UserId,
        task: &Task,
        proof_ref: Option<&str>,
    ) -> Result<VerificationResult, VerifierError>;
}

pub type VerifierRef = Arc<dyn Verifier>;

/// Run a verifier with a hard deadline. Never returns an implicit pass.
pub async fn verify_with_timeout(
    verifier: Option<&VerifierRef>,
    executor_id: &UserId,
    task: &Task,
    proof_ref: Option<&str>,
    timeout: Duration,
) -> VerificationOutcome {
    let Some(verifier) = verifier else {
        return VerificationOutcome::Inconclusive("no verifier configured".to_string());
    };

    match tokio::time::timeout(timeout, verifier.verify_completion(executor_id, task, proof_ref)).await {
        Ok(Ok(result)) if result.success => VerificationOutcome::Passed(result.reason),
        Ok(Ok(result)) => VerificationOutcome::Failed(result.reason),
        Ok(Err(e)) => {
            tracing::warn!(task_id = %task.id, executor = %executor_id, "Verifier failed: {}", e);
            VerificationOutcome::Inconclusive(e.to_string())
        }
        Err(_) => {
            tracing::warn!(
                task_id = %task.id,
                executor = %executor_id,
                timeout_ms = timeout.as_millis() as u64,
                "Verifier timed out"
            );
            VerificationOutcome::Inconclusive(format!(
                "verifier timed out after {} ms",
                timeout.as_millis()
            ))
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    executor_id: &'a str,
    task_id: String,
    task_type: &'a str,
    target_ref: &'a str,
    proof_ref: Option<&'a str>,
}

/// Verifier reached over HTTP: POST JSON, expects `{success, reason}`.
pub struct HttpVerifier {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpVerifier {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Result<Self, VerifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifierError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify_completion(
        &self,
        executor_id: &UserId,
        task: &Task,
        proof_ref: Option<&str>,
    ) -> Result<VerificationResult, VerifierError> {
        let body = VerifyRequest {
            executor_id: executor_id.as_str(),
            task_id: task.id.to_string(),
            task_type: task.task_type.as_str(),
            target_ref: &task.target_ref,
            proof_ref,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| VerifierError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifierError::Status(status.as_u16()));
        }
        response
            .json::<VerificationResult>()
            .await
            .map_err(|e| VerifierError::Malformed(e.to_string()))
    }
}

/// Verifier with a fixed answer and optional delay, for tests and local runs.
pub struct StaticVerifier {
    answer: Result<VerificationResult, VerifierError>,
    delay: Duration,
}

impl StaticVerifier {
    pub fn passing() -> Self {
        Self {
            answer: Ok(VerificationResult::pass("membership confirmed")),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            answer: Ok(VerificationResult::fail(reason)),
            delay: Duration::ZERO,
        }
    }

    pub fn erroring() -> Self {
        Self {
            answer: Err(VerifierError::Transport("connection refused".to_string())),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Verifier for StaticVerifier {
    async fn verify_completion(
        &self,
        _executor_id: &UserId,
        _task: &Task,
        _proof_ref: Option<&str>,
    ) -> Result<VerificationResult, VerifierError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answer.clone()
    }
}
