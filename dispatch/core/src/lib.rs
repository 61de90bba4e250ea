//! Dispatch Core - Request Routing and Admission Control for LLM Providers
//!
//! This crate decides which provider and model serve each completion request
//! and keeps traffic to every provider inside its limits. Provider failures
//! are classified once and drive both in-place retries and fallback.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Router                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │ FallbackChain│  │ ModelCatalog │  │  RouterMetrics     │  │
//! │  └──────┬───────┘  └──────┬───────┘  └────────────────────┘  │
//! │         └────────┬────────┘                                  │
//! │                  v                                           │
//! │  ┌──────────────────────┐   ┌───────────────────────┐        │
//! │  │ ConcurrencyManager   │──>│     RateLimiter       │        │
//! │  │ (permits, spacing,   │   │ (per-provider token   │        │
//! │  │  reservoir)          │   │  buckets)             │        │
//! │  └──────────┬───────────┘   └───────────────────────┘        │
//! └─────────────┼────────────────────────────────────────────────┘
//!               v
//!     ProviderRegistry ──> dyn LlmProvider ──> ProviderError
//!                                                  │
//!                                 classify() <─────┘
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: Entry point; routes a [`CompletionRequest`] under a [`RoutingContext`]
//! - [`ProviderRegistry`]: Named providers the router can reach
//! - [`RateLimiter`]: Requests-per-minute token buckets
//! - [`ConcurrencyManager`]: In-flight permits with FIFO waiters
//! - [`FallbackChain`]: Ordered candidates tried until one succeeds
//! - [`DispatchConfig`]: Settings loaded from TOML, environment, and CLI
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dispatch_core::{
//!     backend::{CompletionRequest, MockProvider, ProviderRegistry},
//!     config::load_config,
//!     routing::{Router, RoutingContext, TaskType},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(ProviderRegistry::new());
//!     registry.register(Arc::new(MockProvider::new("mcp")));
//!
//!     let config = load_config()?;
//!     let router = Router::from_config(registry, &config);
//!
//!     let response = router
//!         .route(
//!             &CompletionRequest::new("Explain this stack trace"),
//!             &RoutingContext::new(TaskType::Debugging),
//!         )
//!         .await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod routing;

pub use backend::{
    CompletionRequest, CompletionResponse, LlmProvider, ProviderCapabilities, ProviderError,
    ProviderRegistry,
};
pub use config::{load_config, load_config_from_path, ConfigError, ConfigOverrides, DispatchConfig};
pub use routing::{
    classify, ClassifiedError, ConcurrencyManager, ErrorKind, FallbackChain, RateLimiter, Router,
    RouterError, RoutingContext, RoutingPriority, TaskType,
};
