//! AI enrichment: README summaries and preview-media ranking.
//!
//! Callers never see an error from this module. Quota errors are retried with
//! exponential backoff, everything else degrades to "no result".

mod gemini;

pub use gemini::GeminiClient;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::random;
use thiserror::Error;
use tracing::{debug, warn};

/// READMEs shorter than this are not worth summarizing.
pub const MIN_README_LEN: usize = 50;
/// Characters of README sent with each prompt.
pub const README_PROMPT_LIMIT: usize = 12_000;
/// Upper bound on media returned by [`EnrichmentClient::select_media`].
pub const MAX_SELECTED_MEDIA: usize = 3;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl EnrichmentError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    /// Plain-text summary of a README, or `None`.
    async fn summarize(&self, readme: &str) -> Option<String>;

    /// Up to [`MAX_SELECTED_MEDIA`] URLs picked from `candidates`, best first.
    async fn select_media(&self, readme: &str, candidates: &[String]) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// `base^attempt + U(0,1)` seconds after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.powi(attempt as i32);
        Duration::from_secs_f64(exp + random::<f64>())
    }
}

/// Run `op` until it succeeds, fails with a non-quota error, or the attempt
/// budget is spent.
pub async fn retry_on_quota<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &'static str,
    mut op: F,
) -> Result<T, EnrichmentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EnrichmentError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_quota() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Enrichment quota hit, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_quota() {
                    warn!(op = op_name, attempts = attempt, "Enrichment quota retries exhausted");
                } else {
                    debug!(op = op_name, error = %err, "Enrichment call failed");
                }
                return Err(err);
            }
        }
    }
}
