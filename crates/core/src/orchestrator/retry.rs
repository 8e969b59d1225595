use ghost_llm::{CompletionRequest, CompletionResponse, InferenceBackend, LlmError};
use std::time::Duration;

use crate::config::GhostCfg;

/// Bounded attempts with exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_cfg(cfg: &GhostCfg) -> Self {
        Self {
            max_attempts: cfg.inference_max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

#[derive(Debug)]
pub enum InferenceOutcome {
    Completed { response: CompletionResponse, attempts: u32 },
    Exhausted { attempts: u32, last_error: LlmError },
}

/// Run `request` against `backend` until it succeeds or the policy is spent.
pub async fn complete_with_retry(
    backend: &dyn InferenceBackend,
    request: &CompletionRequest,
    policy: RetryPolicy,
) -> InferenceOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match backend.complete(request.clone()).await {
            Ok(response) => return InferenceOutcome::Completed { response, attempts: attempt },
            Err(e) if attempt >= policy.max_attempts => {
                return InferenceOutcome::Exhausted { attempts: attempt, last_error: e };
            }
            Err(e) => {
                let delay = policy.backoff_after(attempt);
                tracing::warn!(
                    backend = backend.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "inference attempt failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
