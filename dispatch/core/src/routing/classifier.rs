//! Error Classification and Backoff
//!
//! Maps raw provider failures onto a fixed taxonomy carrying retryability and
//! a suggested delay, and provides the generic retry loop the router wraps
//! single-provider calls in.
//!
//! # Classification Precedence
//!
//! ```text
//! 429 / "rate limit" / "quota exceeded" / "too many requests"  -> rate_limit      (retry, Retry-After or 60s)
//! 401 / 403 / "unauthorized" / "invalid api key"               -> authentication  (no retry)
//! "timeout" / ETIMEDOUT / ECONNRESET                           -> timeout         (retry, 2s)
//! ECONNREFUSED / ENOTFOUND / ENETUNREACH / "network"           -> network         (retry, 1s)
//! 400 / "bad request" / "invalid request"                      -> invalid_request (no retry)
//! >= 500 / "server error"                                      -> server_error    (retry, 5s)
//! anything else                                                -> unknown         (no retry)
//! ```
//!
//! The first matching row wins.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ProviderError;

/// Fallback delay for rate limits without a usable `Retry-After`
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_millis(60_000);
const TIMEOUT_DELAY: Duration = Duration::from_millis(2_000);
const NETWORK_DELAY: Duration = Duration::from_millis(1_000);
const SERVER_ERROR_DELAY: Duration = Duration::from_millis(5_000);

// ============================================================================
// Taxonomy
// ============================================================================

/// Kind of failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Authentication,
    Timeout,
    Network,
    InvalidRequest,
    ServerError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Unknown => "unknown",
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "Rate limit exceeded",
            ErrorKind::Authentication => "Authentication failed",
            ErrorKind::Timeout => "Request timed out",
            ErrorKind::Network => "Network error",
            ErrorKind::InvalidRequest => "Invalid request",
            ErrorKind::ServerError => "Provider server error",
            ErrorKind::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure mapped onto the taxonomy
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    pub retryable: bool,
    /// Delay the failure itself asks for, if any
    pub suggested_delay: Option<Duration>,
    /// The original error
    pub source: ProviderError,
}

impl ClassifiedError {
    fn new(kind: ErrorKind, retryable: bool, delay: Option<Duration>, error: &ProviderError) -> Self {
        Self {
            kind,
            message: format!("{}: {}", kind.summary(), error),
            retryable,
            suggested_delay: delay,
            source: error.clone(),
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Classify a provider error
pub fn classify(error: &ProviderError) -> ClassifiedError {
    let message = error.message.to_lowercase();
    let status = error.status;
    let mentions = |needle: &str| message.contains(needle);
    let has_code = |code: &str| {
        error
            .code
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(code))
            || message.contains(&code.to_lowercase())
    };

    if status == Some(429)
        || mentions("rate limit")
        || mentions("quota exceeded")
        || mentions("too many requests")
    {
        let delay = error
            .retry_after
            .as_deref()
            .map_or(DEFAULT_RATE_LIMIT_DELAY, parse_retry_after);
        return ClassifiedError::new(ErrorKind::RateLimit, true, Some(delay), error);
    }

    if matches!(status, Some(401) | Some(403))
        || mentions("unauthorized")
        || mentions("invalid api key")
    {
        return ClassifiedError::new(ErrorKind::Authentication, false, None, error);
    }

    if mentions("timeout") || has_code("ETIMEDOUT") || has_code("ECONNRESET") {
        return ClassifiedError::new(ErrorKind::Timeout, true, Some(TIMEOUT_DELAY), error);
    }

    if has_code("ECONNREFUSED")
        || has_code("ENOTFOUND")
        || has_code("ENETUNREACH")
        || mentions("network")
    {
        return ClassifiedError::new(ErrorKind::Network, true, Some(NETWORK_DELAY), error);
    }

    if status == Some(400) || mentions("bad request") || mentions("invalid request") {
        return ClassifiedError::new(ErrorKind::InvalidRequest, false, None, error);
    }

    if status.is_some_and(|s| s >= 500) || mentions("server error") {
        return ClassifiedError::new(
            ErrorKind::ServerError,
            true,
            Some(SERVER_ERROR_DELAY),
            error,
        );
    }

    ClassifiedError::new(ErrorKind::Unknown, false, None, error)
}

/// Parse a `Retry-After` value relative to the current time
pub fn parse_retry_after(value: &str) -> Duration {
    parse_retry_after_at(value, Utc::now())
}

/// Parse a `Retry-After` value relative to `now`
///
/// Numbers are seconds. Dates (RFC 2822 / HTTP-date, or RFC 3339) are absolute
/// and yield the delta to `now`, or zero when already past. Anything else
/// yields [`DEFAULT_RATE_LIMIT_DELAY`].
pub fn parse_retry_after_at(value: &str, now: DateTime<Utc>) -> Duration {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).unwrap_or(DEFAULT_RATE_LIMIT_DELAY);
    }

    let target = DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc));

    match target {
        Ok(target) => (target - now).to_std().unwrap_or(Duration::ZERO),
        Err(_) => DEFAULT_RATE_LIMIT_DELAY,
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Options for the generic retry loop
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffOptions {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub factor: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            factor: 2.0,
        }
    }
}

impl BackoffOptions {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }
}

/// Whether a failed attempt (0-based) should be retried
pub fn should_retry(classified: &ClassifiedError, attempt: u32, max_retries: u32) -> bool {
    classified.retryable && attempt < max_retries
}

/// Delay before the retry that follows `attempt` (0-based)
///
/// A suggested delay wins, capped at `max_delay`. Otherwise
/// `initial * factor^attempt`, doubled for rate limits, capped at `max_delay`.
pub fn calculate_delay(classified: &ClassifiedError, attempt: u32, opts: &BackoffOptions) -> Duration {
    if let Some(suggested) = classified.suggested_delay {
        return suggested.min(opts.max_delay);
    }

    let multiplier = if classified.kind == ErrorKind::RateLimit {
        2.0
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let millis = opts.initial_delay.as_millis() as f64 * opts.factor.powi(exponent) * multiplier;
    let max_millis = opts.max_delay.as_millis() as f64;

    Duration::from_millis(millis.min(max_millis).max(0.0) as u64)
}

/// Errors the retry loop can reason about
///
/// `None` means the error is not a provider failure and must not be retried.
pub trait RetryClassify {
    fn retry_class(&self) -> Option<ClassifiedError>;
}

impl RetryClassify for ProviderError {
    fn retry_class(&self) -> Option<ClassifiedError> {
        Some(classify(self))
    }
}

impl RetryClassify for ClassifiedError {
    fn retry_class(&self) -> Option<ClassifiedError> {
        Some(self.clone())
    }
}

/// Run `op` until it succeeds or the failure is not worth retrying
///
/// `op` receives the 0-based attempt number. It runs at most
/// `max_retries + 1` times; the last error is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(opts: &BackoffOptions, op: F) -> Result<T, E>
where
    E: RetryClassify,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff_observed(opts, op, |_, _, _| {}).await
}

/// [`retry_with_backoff`] with a callback invoked before each retry sleep
///
/// The callback receives the upcoming attempt number, the delay, and the error.
pub async fn retry_with_backoff_observed<T, E, F, Fut, R>(
    opts: &BackoffOptions,
    mut op: F,
    mut on_retry: R,
) -> Result<T, E>
where
    E: RetryClassify,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, Duration, &E),
{
    let mut attempt = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(classified) = err.retry_class() else {
            return Err(err);
        };
        if !should_retry(&classified, attempt, opts.max_retries) {
            return Err(err);
        }

        let delay = calculate_delay(&classified, attempt, opts);
        tracing::debug!(
            attempt = attempt + 1,
            kind = %classified.kind,
            delay_ms = delay.as_millis() as u64,
            "Retrying after backoff"
        );
        on_retry(attempt + 1, delay, &err);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
