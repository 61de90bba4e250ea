//! Mock Provider
//!
//! A scripted provider for exercising routing without real model calls.
//! Outcomes are queued per call; once the queue is empty the provider falls
//! back to its standing behavior (succeed, or always fail with a fixed error).
//!
//! # Usage
//!
//! ```ignore
//! use dispatch_core::backend::{MockProvider, ProviderError};
//!
//! let provider = MockProvider::new("mcp")
//!     .queue_error(ProviderError::http(429, "rate limit exceeded"))
//!     .with_latency(Duration::from_millis(50));
//!
//! // First call fails with a 429, the second succeeds
//! assert_eq!(provider.call_count(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{
    CompletionRequest, CompletionResponse, LlmProvider, ModelInfo, ProviderCapabilities,
    ProviderError,
};

// ============================================================================
// Scripted Outcomes
// ============================================================================

/// One scripted call result
#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// Succeed with the given content
    Respond(String),
    /// Fail with the given error
    Fail(ProviderError),
}

/// Decrements the in-flight gauge when a call finishes
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Mock Provider
// ============================================================================

/// Deterministic provider for tests and offline runs
pub struct MockProvider {
    name: String,
    capabilities: ProviderCapabilities,
    models: Vec<String>,
    /// Outcomes consumed in order, one per call
    script: Mutex<VecDeque<MockOutcome>>,
    /// Error returned once the script is empty (None = succeed)
    standing_error: Option<ProviderError>,
    /// Simulated call latency
    latency: Option<Duration>,
    /// Request history for verification
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("name", &self.name)
            .field("calls", &self.call_count())
            .field("latency", &self.latency)
            .finish()
    }
}

impl MockProvider {
    /// Create a provider that always succeeds
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: ProviderCapabilities::default(),
            models: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            standing_error: None,
            latency: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a provider that fails every call with `error`
    pub fn failing(name: impl Into<String>, error: ProviderError) -> Self {
        Self {
            standing_error: Some(error),
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Simulate network latency on every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue an error for the next unscripted call
    #[must_use]
    pub fn queue_error(self, error: ProviderError) -> Self {
        self.push(MockOutcome::Fail(error));
        self
    }

    /// Queue a successful response for the next unscripted call
    #[must_use]
    pub fn queue_response(self, content: impl Into<String>) -> Self {
        self.push(MockOutcome::Respond(content.into()));
        self
    }

    /// Append an outcome to the script
    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Number of `complete` calls received
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `complete` calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Requests received, oldest first
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        match &self.standing_error {
            Some(error) => MockOutcome::Fail(error.clone()),
            None => MockOutcome::Respond(format!("mock response from {}", self.name)),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        self.requests.lock().push(request.clone());

        if let Some(latency) = self.latency {
            // Simulated latency
            tokio::time::sleep(latency).await;
        }

        match self.next_outcome() {
            MockOutcome::Respond(content) => {
                let model = request.model.clone().unwrap_or_else(|| self.name.clone());
                Ok(CompletionResponse::new(model, content))
            }
            MockOutcome::Fail(error) => Err(error),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(self.models.iter().map(ModelInfo::new).collect())
    }
}
