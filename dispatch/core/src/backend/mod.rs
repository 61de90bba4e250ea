//! LLM Provider Integration
//!
//! This module provides abstracted access to model providers through a common
//! trait interface, plus the registry the router resolves provider names
//! against.
//!
//! # Usage
//!
//! ```ignore
//! use dispatch_core::backend::{MockProvider, ProviderRegistry};
//!
//! let registry = ProviderRegistry::new();
//! registry.register(Arc::new(MockProvider::new("mcp")));
//! let provider = registry.get("mcp").expect("registered");
//! ```

mod mock;
mod traits;

use std::sync::Arc;

use parking_lot::RwLock;

pub use mock::{MockOutcome, MockProvider};
pub use traits::{
    CompletionRequest, CompletionResponse, LlmProvider, Message, MessageRole, ModelInfo,
    ProviderCapabilities, ProviderError, StreamChunk, TokenUsage, ToolDefinition,
};

// ============================================================================
// Provider Lookup
// ============================================================================

/// Resolves a provider name to a live provider
pub trait ProviderLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn LlmProvider>>;
}

// ============================================================================
// Provider Registry
// ============================================================================

/// Explicit name to provider registry
///
/// Providers keep their registration order, which is the order candidates are
/// enumerated in when the router scores them.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<dyn LlmProvider>>>,
    default_provider: RwLock<Option<String>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any provider with the same name
    pub fn register(&self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        let mut providers = self.providers.write();
        if let Some(slot) = providers.iter_mut().find(|p| p.name() == name) {
            *slot = provider;
        } else {
            providers.push(provider);
        }
        tracing::info!(provider = %name, "Registered provider");
    }

    /// Register a provider and make it the default
    pub fn register_default(&self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        self.register(provider);
        *self.default_provider.write() = Some(name);
    }

    /// Remove a provider by name
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        let mut providers = self.providers.write();
        let index = providers.iter().position(|p| p.name() == name)?;
        Some(providers.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().iter().any(|p| p.name() == name)
    }

    /// Provider names in registration order
    pub fn names(&self) -> Vec<String> {
        self.providers
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Snapshot of all providers in registration order
    pub fn providers(&self) -> Vec<Arc<dyn LlmProvider>> {
        self.providers.read().clone()
    }

    /// The default provider, or the first registered one
    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        let default = self.default_provider.read().clone();
        match default {
            Some(name) => self.get(&name),
            None => self.providers.read().first().cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

impl ProviderLookup for ProviderRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.get(name)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
