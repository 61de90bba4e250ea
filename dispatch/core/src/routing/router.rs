//! Request Router
//!
//! The public entry point of the dispatch layer. Composes the fallback chain,
//! the rate limiter, the concurrency manager, and the error classifier.
//!
//! # Modes
//!
//! ```text
//! route(request, context)
//!     |
//!     +-- use_fallback (default) --> FallbackChain::execute_with
//!     |                                 each attempt: [permit -> token ->] complete
//!     |
//!     +-- single provider ---------> resolve target (preferred model or scoring)
//!                                       permit (held for the whole call)
//!                                       retry_with_backoff:
//!                                           token -> complete -> annotate error
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;

use super::classifier::{retry_with_backoff_observed, ClassifiedError, RetryClassify};
use super::config::{ConcurrencySettings, RateLimitSettings, RouterSettings, RoutingContext, TaskType};
use super::fallback::{
    AdmissionError, AttemptError, FallbackChain, FallbackError, FallbackExecutionResult,
    ProviderCandidate,
};
use super::metrics::RouterMetrics;
use super::policy::{meets_requirements, select_best, ModelCatalog, ModelProfile};
use super::rate_limit::{RateLimitTimeout, RateLimiter};
use super::semaphore::{ConcurrencyManager, ConcurrencyPermit, PermitTimeout};
use crate::backend::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError, ProviderRegistry};
use crate::config::DispatchConfig;

// ============================================================================
// Model Strings
// ============================================================================

/// An explicit `provider/model` pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedModel {
    pub provider: String,
    pub model: String,
}

/// Split `provider/model`
///
/// The provider part must be lowercase ASCII letters. Anything else is treated
/// as a bare model id and yields `None`.
pub fn parse_model(model: &str) -> Option<ParsedModel> {
    let (provider, rest) = model.split_once('/')?;
    if provider.is_empty() || rest.is_empty() || !provider.bytes().all(|b| b.is_ascii_lowercase())
    {
        return None;
    }
    Some(ParsedModel {
        provider: provider.to_string(),
        model: rest.to_string(),
    })
}

/// Where a single-provider request will go
#[derive(Clone, Debug, PartialEq)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
    /// Selection score, when chosen by scoring
    pub score: Option<f64>,
}

// ============================================================================
// Errors
// ============================================================================

/// A provider failure tagged with where and when it happened
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{provider}/{model} failed on attempt {attempt}: {classified}")]
pub struct AnnotatedProviderError {
    pub provider: String,
    pub model: String,
    /// 1-based attempt number
    pub attempt: u32,
    #[source]
    pub classified: ClassifiedError,
}

impl AnnotatedProviderError {
    /// The error as returned by the provider
    pub fn provider_error(&self) -> &ProviderError {
        &self.classified.source
    }
}

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// Every fallback candidate failed
    #[error(transparent)]
    Exhausted(#[from] FallbackError),
    /// Explicitly requested provider is not registered
    #[error("Provider not available: {0}")]
    ProviderUnavailable(String),
    /// Nothing in the catalog fits and no default model is configured
    #[error("No suitable model for {task} task")]
    NoSuitableModel { task: TaskType },
    /// Single-provider call failed
    #[error(transparent)]
    Provider(Box<AnnotatedProviderError>),
    #[error(transparent)]
    RateLimitTimeout(#[from] RateLimitTimeout),
    #[error(transparent)]
    PermitTimeout(#[from] PermitTimeout),
}

impl RouterError {
    /// Classification of the underlying provider failure, if there is one
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            RouterError::Provider(annotated) => Some(&annotated.classified),
            _ => None,
        }
    }
}

/// Failure inside one single-provider attempt
enum SingleAttemptError {
    Provider(Box<AnnotatedProviderError>),
    RateLimit(RateLimitTimeout),
}

impl RetryClassify for SingleAttemptError {
    fn retry_class(&self) -> Option<ClassifiedError> {
        match self {
            SingleAttemptError::Provider(annotated) => Some(annotated.classified.clone()),
            // Admission timeouts go back to the caller
            SingleAttemptError::RateLimit(_) => None,
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Routes completion requests to providers
pub struct Router {
    registry: Arc<ProviderRegistry>,
    catalog: RwLock<ModelCatalog>,
    rate_limiter: Arc<RateLimiter>,
    concurrency: Arc<ConcurrencyManager>,
    chain: Arc<FallbackChain>,
    metrics: Arc<RouterMetrics>,
    settings: RwLock<RouterSettings>,
}

impl Router {
    /// Create a router with built-in defaults
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            catalog: RwLock::new(ModelCatalog::default()),
            rate_limiter: Arc::new(RateLimiter::default()),
            concurrency: Arc::new(ConcurrencyManager::default()),
            chain: Arc::new(FallbackChain::with_defaults()),
            metrics: Arc::new(RouterMetrics::new()),
            settings: RwLock::new(RouterSettings::default()),
        }
    }

    /// Create a router from loaded configuration
    pub fn from_config(registry: Arc<ProviderRegistry>, config: &DispatchConfig) -> Self {
        let router = Self::new(registry);
        router.apply_config(config);
        router
    }

    #[must_use]
    pub fn with_settings(self, settings: RouterSettings) -> Self {
        *self.settings.write() = settings;
        self
    }

    #[must_use]
    pub fn with_rate_limits(self, settings: &RateLimitSettings) -> Self {
        self.rate_limiter.apply_settings(settings);
        self
    }

    #[must_use]
    pub fn with_concurrency(self, settings: &ConcurrencySettings) -> Self {
        self.concurrency.apply_settings(settings);
        self
    }

    #[must_use]
    pub fn with_chain(self, candidates: Vec<ProviderCandidate>) -> Self {
        self.chain.update_chain(candidates);
        self
    }

    #[must_use]
    pub fn with_catalog(self, catalog: ModelCatalog) -> Self {
        *self.catalog.write() = catalog;
        self
    }

    /// Push new limits, chain, catalog entries, and settings into the live router
    pub fn apply_config(&self, config: &DispatchConfig) {
        *self.settings.write() = config.router.clone();
        self.rate_limiter.apply_settings(&config.rate_limits);
        self.concurrency.apply_settings(&config.concurrency);
        self.chain.update_chain(config.fallback.clone());

        let mut catalog = ModelCatalog::default();
        for profile in &config.models {
            catalog.upsert(profile.clone());
        }
        *self.catalog.write() = catalog;

        tracing::info!(
            use_fallback = config.router.use_fallback,
            candidates = config.fallback.len(),
            "Router configuration applied"
        );
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    pub fn chain(&self) -> &Arc<FallbackChain> {
        &self.chain
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn settings(&self) -> RouterSettings {
        self.settings.read().clone()
    }

    /// Route a request to a provider
    pub async fn route(
        &self,
        request: &CompletionRequest,
        context: &RoutingContext,
    ) -> Result<CompletionResponse, RouterError> {
        let start = Instant::now();
        self.metrics.routed.inc();

        let use_fallback = self.settings.read().use_fallback;
        let result = if use_fallback {
            self.route_detailed(request, context)
                .await
                .into_result()
                .map_err(RouterError::from)
        } else {
            self.route_single(request, context).await
        };

        self.metrics.route_latency.record_duration(start.elapsed());
        result
    }

    /// Route through the fallback chain, returning the full bookkeeping
    pub async fn route_detailed(
        &self,
        request: &CompletionRequest,
        context: &RoutingContext,
    ) -> FallbackExecutionResult {
        let admission = self.settings.read().fallback_admission;
        let result = self
            .chain
            .execute_with(
                request,
                context,
                self.registry.as_ref(),
                move |provider, candidate, request| {
                    self.chain_attempt(provider, candidate, request, admission)
                },
            )
            .await;

        let advanced = result.attempted_providers.len() - usize::from(result.is_success());
        for _ in 0..advanced {
            self.metrics.fallback_advances.inc();
        }
        if !result.is_success() {
            self.metrics.chains_exhausted.inc();
        }
        result
    }

    async fn chain_attempt(
        &self,
        provider: Arc<dyn LlmProvider>,
        candidate: ProviderCandidate,
        request: CompletionRequest,
        admission: bool,
    ) -> Result<CompletionResponse, AttemptError> {
        let metrics = self.metrics.provider(&candidate.provider);

        let _permit = if admission {
            match self.admit(&candidate.provider).await {
                Ok(permit) => Some(permit),
                Err(err) => {
                    metrics.admission_timeouts.inc();
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        metrics.requests.inc();
        match provider.complete(&request).await {
            Ok(response) => {
                metrics.successes.inc();
                Ok(response)
            }
            Err(err) => {
                metrics.failures.inc();
                Err(err.into())
            }
        }
    }

    /// Permit, then token
    async fn admit(&self, provider: &str) -> Result<ConcurrencyPermit, AdmissionError> {
        let permit = self.acquire_permit(provider).await?;
        let token_timeout = self.settings.read().token_timeout;
        self.rate_limiter
            .wait_for_token(provider, token_timeout)
            .await?;
        Ok(permit)
    }

    async fn acquire_permit(&self, provider: &str) -> Result<ConcurrencyPermit, PermitTimeout> {
        let permit_timeout = self.settings.read().permit_timeout;
        match permit_timeout {
            Some(timeout) => self.concurrency.acquire_timeout(provider, timeout).await,
            None => Ok(self.concurrency.acquire(provider).await),
        }
    }

    /// Profiles whose provider is registered and has the required capabilities
    ///
    /// Models without a required unrestricted or multilingual trait are
    /// dropped before scoring.
    pub fn candidates(&self, context: &RoutingContext) -> Vec<ModelProfile> {
        let catalog = self.catalog.read();
        catalog
            .profiles()
            .iter()
            .filter(|profile| {
                let Some(provider) = self.registry.get(&profile.provider) else {
                    return false;
                };
                let caps = provider.capabilities();
                (!context.requires_vision || caps.vision)
                    && (!context.requires_tools || caps.tools)
                    && meets_requirements(profile, context)
            })
            .cloned()
            .collect()
    }

    /// Decide where a single-provider request goes
    pub fn resolve_target(&self, context: &RoutingContext) -> Result<RouteTarget, RouterError> {
        if let Some(preferred) = &context.preferred_model {
            if let Some(parsed) = parse_model(preferred) {
                if !self.registry.contains(&parsed.provider) {
                    return Err(RouterError::ProviderUnavailable(parsed.provider));
                }
                return Ok(RouteTarget {
                    provider: parsed.provider,
                    model: parsed.model,
                    score: None,
                });
            }

            if let Some(profile) = self
                .candidates(context)
                .into_iter()
                .find(|p| p.model == *preferred)
            {
                return Ok(RouteTarget {
                    provider: profile.provider,
                    model: profile.model,
                    score: None,
                });
            }
            tracing::debug!(model = %preferred, "Preferred model not in catalog, scoring instead");
        }

        let candidates = self.candidates(context);
        if let Some(best) = select_best(&candidates, context) {
            return Ok(RouteTarget {
                provider: best.profile.provider,
                model: best.profile.model,
                score: Some(best.score),
            });
        }

        let default_model = self.settings.read().default_model.clone();
        match default_model.as_deref().and_then(parse_model) {
            Some(parsed) if self.registry.contains(&parsed.provider) => Ok(RouteTarget {
                provider: parsed.provider,
                model: parsed.model,
                score: None,
            }),
            Some(parsed) => Err(RouterError::ProviderUnavailable(parsed.provider)),
            None => Err(RouterError::NoSuitableModel {
                task: context.task_type,
            }),
        }
    }

    async fn route_single(
        &self,
        request: &CompletionRequest,
        context: &RoutingContext,
    ) -> Result<CompletionResponse, RouterError> {
        let target = self.resolve_target(context)?;
        let provider = self
            .registry
            .get(&target.provider)
            .ok_or_else(|| RouterError::ProviderUnavailable(target.provider.clone()))?;
        let settings = self.settings();
        let metrics = self.metrics.provider(&target.provider);

        let permit = match self.acquire_permit(&target.provider).await {
            Ok(permit) => permit,
            Err(err) => {
                metrics.admission_timeouts.inc();
                return Err(err.into());
            }
        };

        let mut single_request = request.clone();
        single_request.model = Some(target.model.clone());

        let provider = &provider;
        let single_request = &single_request;
        let target = &target;
        let metrics = &metrics;
        let token_timeout = settings.token_timeout;

        let outcome = retry_with_backoff_observed(
            &settings.backoff,
            move |attempt| async move {
                self.rate_limiter
                    .wait_for_token(&target.provider, token_timeout)
                    .await
                    .map_err(SingleAttemptError::RateLimit)?;

                metrics.requests.inc();
                provider.complete(single_request).await.map_err(|err| {
                    metrics.failures.inc();
                    SingleAttemptError::Provider(Box::new(AnnotatedProviderError {
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        attempt: attempt + 1,
                        classified: super::classifier::classify(&err),
                    }))
                })
            },
            |next_attempt, delay, err| {
                metrics.retries.inc();
                if let SingleAttemptError::Provider(annotated) = err {
                    tracing::warn!(
                        provider = %target.provider,
                        model = %target.model,
                        attempt = next_attempt,
                        kind = %annotated.classified.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying provider call"
                    );
                }
            },
        )
        .await;

        permit.release();

        match outcome {
            Ok(response) => {
                metrics.successes.inc();
                tracing::info!(
                    provider = %target.provider,
                    model = %target.model,
                    task = %context.task_type,
                    "Request completed"
                );
                Ok(response)
            }
            Err(SingleAttemptError::Provider(annotated)) => Err(RouterError::Provider(annotated)),
            Err(SingleAttemptError::RateLimit(timeout)) => {
                metrics.admission_timeouts.inc();
                Err(RouterError::RateLimitTimeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .field("chain", &self.chain.get_chain())
            .field("settings", &*self.settings.read())
            .finish()
    }
}
