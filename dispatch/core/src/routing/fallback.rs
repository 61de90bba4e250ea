//! Fallback Chain
//!
//! An ordered list of provider/model candidates tried in turn until one
//! succeeds.
//!
//! # Execution
//!
//! ```text
//! candidates (ascending priority, ties in insertion order)
//!     |
//!     v
//! provider registered? --no--> warn, skip
//!     | yes
//!     v
//! call ----ok----> return (attempted, successful, attempts, duration)
//!     | err
//!     v
//! rate-limit shaped and budget left? --yes--> sleep backoff + jitter, call again
//!     | no
//!     v
//! next candidate ... all exhausted -> FallbackError::Exhausted
//! ```
//!
//! Only rate-limit shaped failures are retried in place. Everything else
//! advances the chain immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use super::config::RoutingContext;
use super::rate_limit::RateLimitTimeout;
use super::semaphore::PermitTimeout;
use crate::backend::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError, ProviderLookup};

/// Upper bound of the random jitter added to chain retry delays
const MAX_JITTER_FRACTION: f64 = 0.25;

// ============================================================================
// Candidates
// ============================================================================

/// One entry in the fallback chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderCandidate {
    /// Provider registry name
    pub provider: String,
    /// Model id sent to the provider
    pub model: String,
    /// Lower is tried first
    pub priority: u32,
    /// Attempts allowed on this candidate
    pub max_retries: u32,
    /// Base delay between rate-limited attempts
    pub retry_delay: Duration,
    /// Double the delay after every attempt
    pub use_exponential_backoff: bool,
}

impl ProviderCandidate {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, priority: u32) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            priority,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            use_exponential_backoff: true,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    /// `provider/model`
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    /// Attempts this candidate gets; always at least one
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay after the given 1-based attempt, before jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.retry_delay;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_delay.saturating_mul(1u32 << exponent)
    }
}

/// Default chain: agentic first, then fast multilingual, then hosted models
pub fn default_candidates() -> Vec<ProviderCandidate> {
    vec![
        ProviderCandidate::new("mcp", "kimi-k2", 1)
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(5000)),
        ProviderCandidate::new("mcp", "glm-4.7", 2).with_retry_delay(Duration::from_millis(2000)),
        ProviderCandidate::new("featherless", "llama-70b", 3),
        ProviderCandidate::new("featherless", "dolphin-3", 4),
    ]
}

/// Fail-fast chain for reflective reasoning loops
pub fn reasoning_candidates() -> Vec<ProviderCandidate> {
    vec![
        ProviderCandidate::new("mcp", "kimi-k2", 1)
            .with_max_retries(1)
            .with_retry_delay(Duration::from_millis(3000)),
        ProviderCandidate::new("mcp", "glm-4.7", 2)
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(2000)),
        ProviderCandidate::new("featherless", "llama-70b", 3).with_max_retries(2),
    ]
}

/// Chain-level rate limit heuristic on an error message
pub fn is_rate_limit_shaped(message: &str) -> bool {
    let message = message.to_lowercase();
    ["rate limit", "429", "concurrency limit", "quota exceeded"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn with_jitter(delay: Duration) -> Duration {
    let fraction = rand::thread_rng().gen_range(0.0..MAX_JITTER_FRACTION);
    delay + delay.mul_f64(fraction)
}

// ============================================================================
// Errors and Results
// ============================================================================

/// Admission control refused a call in time
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error(transparent)]
    RateLimit(#[from] RateLimitTimeout),
    #[error(transparent)]
    Permit(#[from] PermitTimeout),
}

/// Why one candidate attempt failed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

impl AttemptError {
    /// Whether the chain should retry the same candidate
    ///
    /// Admission timeouts never are; the next candidate may have capacity.
    pub fn is_rate_limit_shaped(&self) -> bool {
        match self {
            AttemptError::Provider(err) => is_rate_limit_shaped(&err.to_string()),
            AttemptError::Admission(_) => false,
        }
    }
}

/// Failure of a whole chain execution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackError {
    /// Every candidate failed or was skipped
    Exhausted {
        attempted: Vec<String>,
        last_error: Option<AttemptError>,
    },
}

impl FallbackError {
    pub fn attempted(&self) -> &[String] {
        match self {
            Self::Exhausted { attempted, .. } => attempted,
        }
    }

    pub fn last_error(&self) -> Option<&AttemptError> {
        match self {
            Self::Exhausted { last_error, .. } => last_error.as_ref(),
        }
    }
}

impl std::fmt::Display for FallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted {
                attempted,
                last_error,
            } => {
                let tried = if attempted.is_empty() {
                    "none".to_string()
                } else {
                    attempted.join(", ")
                };
                write!(f, "All fallback providers exhausted (tried: {tried})")?;
                if let Some(err) = last_error {
                    write!(f, ": {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for FallbackError {}

/// Bookkeeping for one chain execution
#[derive(Debug)]
pub struct FallbackExecutionResult {
    pub outcome: Result<CompletionResponse, FallbackError>,
    /// Providers tried, in order, once per candidate
    pub attempted_providers: Vec<String>,
    pub successful_provider: Option<String>,
    /// Calls made across all candidates
    pub total_attempts: u32,
    pub total_duration: Duration,
}

impl FallbackExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<CompletionResponse, FallbackError> {
        self.outcome
    }
}

// ============================================================================
// Fallback Chain
// ============================================================================

/// Ordered, replaceable list of candidates
#[derive(Debug, Default)]
pub struct FallbackChain {
    candidates: RwLock<Vec<ProviderCandidate>>,
}

impl FallbackChain {
    pub fn new(candidates: Vec<ProviderCandidate>) -> Self {
        let chain = Self::default();
        chain.update_chain(candidates);
        chain
    }

    /// Chain built from [`default_candidates`]
    pub fn with_defaults() -> Self {
        Self::new(default_candidates())
    }

    /// Copy of the current candidates, in execution order
    pub fn get_chain(&self) -> Vec<ProviderCandidate> {
        self.candidates.read().clone()
    }

    /// Replace the candidates; they are stably sorted by priority
    pub fn update_chain(&self, mut candidates: Vec<ProviderCandidate>) {
        candidates.sort_by_key(|c| c.priority);
        *self.candidates.write() = candidates;
    }

    pub fn len(&self) -> usize {
        self.candidates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.read().is_empty()
    }

    /// Walk the chain calling `provider.complete` directly
    pub async fn execute(
        &self,
        request: &CompletionRequest,
        context: &RoutingContext,
        lookup: &dyn ProviderLookup,
    ) -> FallbackExecutionResult {
        self.execute_with(request, context, lookup, |provider, _candidate, request| async move {
            provider.complete(&request).await.map_err(AttemptError::from)
        })
        .await
    }

    /// Walk the chain using `call` for every attempt
    ///
    /// `call` receives the resolved provider, the candidate, and a copy of the
    /// request with `model` set to the candidate's model.
    pub async fn execute_with<F, Fut>(
        &self,
        request: &CompletionRequest,
        context: &RoutingContext,
        lookup: &dyn ProviderLookup,
        mut call: F,
    ) -> FallbackExecutionResult
    where
        F: FnMut(Arc<dyn LlmProvider>, ProviderCandidate, CompletionRequest) -> Fut,
        Fut: Future<Output = Result<CompletionResponse, AttemptError>>,
    {
        let start = Instant::now();
        let mut attempted_providers = Vec::new();
        let mut total_attempts = 0;
        let mut last_error = None;

        for candidate in self.get_chain() {
            let Some(provider) = lookup.lookup(&candidate.provider) else {
                tracing::warn!(
                    provider = %candidate.provider,
                    model = %candidate.model,
                    "Fallback provider not registered, skipping"
                );
                continue;
            };
            attempted_providers.push(candidate.provider.clone());

            let budget = candidate.attempt_budget();
            let mut attempt = 0;
            while attempt < budget {
                attempt += 1;
                total_attempts += 1;

                let mut candidate_request = request.clone();
                candidate_request.model = Some(candidate.model.clone());

                match call(Arc::clone(&provider), candidate.clone(), candidate_request).await {
                    Ok(response) => {
                        tracing::info!(
                            provider = %candidate.provider,
                            model = %candidate.model,
                            task = %context.task_type,
                            attempts = total_attempts,
                            "Fallback chain succeeded"
                        );
                        return FallbackExecutionResult {
                            outcome: Ok(response),
                            attempted_providers,
                            successful_provider: Some(candidate.provider.clone()),
                            total_attempts,
                            total_duration: start.elapsed(),
                        };
                    }
                    Err(err) => {
                        let rate_limited = err.is_rate_limit_shaped();
                        tracing::warn!(
                            provider = %candidate.provider,
                            model = %candidate.model,
                            attempt,
                            rate_limited,
                            error = %err,
                            "Fallback attempt failed"
                        );
                        last_error = Some(err);

                        if !rate_limited || attempt >= budget {
                            break;
                        }
                        let delay = with_jitter(candidate.backoff_for_attempt(attempt));
                        tracing::debug!(
                            provider = %candidate.provider,
                            delay_ms = delay.as_millis() as u64,
                            "Backing off before retrying candidate"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let error = FallbackError::Exhausted {
            attempted: attempted_providers.clone(),
            last_error,
        };
        tracing::warn!(error = %error, "Fallback chain exhausted");
        FallbackExecutionResult {
            outcome: Err(error),
            attempted_providers,
            successful_provider: None,
            total_attempts,
            total_duration: start.elapsed(),
        }
    }
}
