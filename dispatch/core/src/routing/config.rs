//! Routing Configuration Types
//!
//! Task classification, routing context, and the per-provider admission
//! limits the router is built from. These are the runtime forms; the TOML
//! layer in [`crate::config`] converts into them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::classifier::BackoffOptions;

// ============================================================================
// Task Classification
// ============================================================================

/// What the request is for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    #[default]
    General,
    Coding,
    Security,
    Reasoning,
    Creative,
    Writing,
    ReverseEngineering,
    Chinese,
    Debugging,
}

impl TaskType {
    pub const ALL: [TaskType; 9] = [
        TaskType::General,
        TaskType::Coding,
        TaskType::Security,
        TaskType::Reasoning,
        TaskType::Creative,
        TaskType::Writing,
        TaskType::ReverseEngineering,
        TaskType::Chinese,
        TaskType::Debugging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::General => "general",
            TaskType::Coding => "coding",
            TaskType::Security => "security",
            TaskType::Reasoning => "reasoning",
            TaskType::Creative => "creative",
            TaskType::Writing => "writing",
            TaskType::ReverseEngineering => "reverse-engineering",
            TaskType::Chinese => "chinese",
            TaskType::Debugging => "debugging",
        }
    }

    /// Tasks that benefit from agentic models
    pub fn prefers_agentic(&self) -> bool {
        matches!(self, TaskType::Debugging | TaskType::Reasoning)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task type: {s}"))
    }
}

/// Which trade-off the caller cares about
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPriority {
    Speed,
    Quality,
    Cost,
    #[default]
    Balanced,
}

impl fmt::Display for RoutingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingPriority::Speed => "speed",
            RoutingPriority::Quality => "quality",
            RoutingPriority::Cost => "cost",
            RoutingPriority::Balanced => "balanced",
        };
        f.write_str(name)
    }
}

impl FromStr for RoutingPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speed" => Ok(RoutingPriority::Speed),
            "quality" => Ok(RoutingPriority::Quality),
            "cost" => Ok(RoutingPriority::Cost),
            "balanced" => Ok(RoutingPriority::Balanced),
            other => Err(format!("unknown routing priority: {other}")),
        }
    }
}

// ============================================================================
// Routing Context
// ============================================================================

/// Routing hints supplied alongside a request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingContext {
    pub task_type: TaskType,
    pub priority: RoutingPriority,
    /// Requires image input support
    pub requires_vision: bool,
    /// Requires tool calling support
    pub requires_tools: bool,
    /// Requires an unrestricted model
    pub requires_unrestricted: bool,
    /// Requires multilingual / Chinese support
    pub requires_multilingual: bool,
    /// Explicit `provider/model` (or bare model id)
    pub preferred_model: Option<String>,
}

impl RoutingContext {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: RoutingPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_vision(mut self) -> Self {
        self.requires_vision = true;
        self
    }

    #[must_use]
    pub fn with_tools(mut self) -> Self {
        self.requires_tools = true;
        self
    }

    #[must_use]
    pub fn with_unrestricted(mut self) -> Self {
        self.requires_unrestricted = true;
        self
    }

    #[must_use]
    pub fn with_multilingual(mut self) -> Self {
        self.requires_multilingual = true;
        self
    }

    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }
}

// ============================================================================
// Rate Limit Settings
// ============================================================================

/// Requests-per-minute limits by provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Limit for providers without an entry
    pub default_requests_per_minute: u32,
    pub providers: HashMap<String, u32>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let providers = [("anthropic", 50), ("mcp", 60), ("featherless", 30)]
            .into_iter()
            .map(|(name, rpm)| (name.to_string(), rpm))
            .collect();
        Self {
            default_requests_per_minute: 60,
            providers,
        }
    }
}

impl RateLimitSettings {
    pub fn limit_for(&self, provider: &str) -> u32 {
        self.providers
            .get(provider)
            .copied()
            .unwrap_or(self.default_requests_per_minute)
    }
}

// ============================================================================
// Concurrency Settings
// ============================================================================

/// Secondary token bucket refilled to capacity on a fixed interval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservoirSettings {
    pub capacity: u32,
    pub refresh_interval: Duration,
}

/// Admission limits for one provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    /// Maximum simultaneous in-flight calls
    pub max_concurrent: u32,
    /// Pause after acquiring a permit, before the request starts
    pub min_time_between: Option<Duration>,
    pub reservoir: Option<ReservoirSettings>,
}

impl ConcurrencyLimits {
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            max_concurrent,
            min_time_between: None,
            reservoir: None,
        }
    }

    #[must_use]
    pub fn with_min_time_between(mut self, spacing: Duration) -> Self {
        self.min_time_between = Some(spacing);
        self
    }

    #[must_use]
    pub fn with_reservoir(mut self, capacity: u32, refresh_interval: Duration) -> Self {
        self.reservoir = Some(ReservoirSettings {
            capacity,
            refresh_interval,
        });
        self
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Concurrency limits by provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// Limits for providers without an entry
    pub default_limits: ConcurrencyLimits,
    pub providers: HashMap<String, ConcurrencyLimits>,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("anthropic".to_string(), ConcurrencyLimits::new(5));
        providers.insert(
            "mcp".to_string(),
            ConcurrencyLimits::new(2)
                .with_min_time_between(Duration::from_millis(500))
                .with_reservoir(30, Duration::from_secs(60)),
        );
        providers.insert(
            "featherless".to_string(),
            ConcurrencyLimits::new(3).with_min_time_between(Duration::from_millis(1000)),
        );
        Self {
            default_limits: ConcurrencyLimits::default(),
            providers,
        }
    }
}

impl ConcurrencySettings {
    pub fn limits_for(&self, provider: &str) -> ConcurrencyLimits {
        self.providers
            .get(provider)
            .copied()
            .unwrap_or(self.default_limits)
    }
}

// ============================================================================
// Router Settings
// ============================================================================

/// Behavior switches and timeouts for the router
#[derive(Clone, Debug, PartialEq)]
pub struct RouterSettings {
    /// Route through the fallback chain (default) or a single provider
    pub use_fallback: bool,
    /// Apply rate and concurrency limits to fallback candidates too
    pub fallback_admission: bool,
    /// Longest wait for a rate-limit token
    pub token_timeout: Duration,
    /// Longest wait for a concurrency permit (None = wait indefinitely)
    pub permit_timeout: Option<Duration>,
    /// Model used when no candidate qualifies (`provider/model`)
    pub default_model: Option<String>,
    /// Single-provider retry policy
    pub backoff: BackoffOptions,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            use_fallback: true,
            fallback_admission: true,
            token_timeout: Duration::from_secs(60),
            permit_timeout: None,
            default_model: Some("anthropic/claude-sonnet-4-5".to_string()),
            backoff: BackoffOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trips_through_str() {
        for task in TaskType::ALL {
            assert_eq!(task.as_str().parse::<TaskType>(), Ok(task));
        }
        assert!("painting".parse::<TaskType>().is_err());
        assert_eq!(
            "Reverse-Engineering".parse::<TaskType>(),
            Ok(TaskType::ReverseEngineering)
        );
    }

    #[test]
    fn test_agentic_preference() {
        assert!(TaskType::Debugging.prefers_agentic());
        assert!(TaskType::Reasoning.prefers_agentic());
        assert!(!TaskType::Coding.prefers_agentic());
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("SPEED".parse::<RoutingPriority>(), Ok(RoutingPriority::Speed));
        assert_eq!(RoutingPriority::default(), RoutingPriority::Balanced);
        assert!("cheapest".parse::<RoutingPriority>().is_err());
    }

    #[test]
    fn test_default_limit_tables() {
        let rates = RateLimitSettings::default();
        assert_eq!(rates.limit_for("anthropic"), 50);
        assert_eq!(rates.limit_for("unknown"), 60);

        let concurrency = ConcurrencySettings::default();
        let mcp = concurrency.limits_for("mcp");
        assert_eq!(mcp.max_concurrent, 2);
        assert_eq!(mcp.min_time_between, Some(Duration::from_millis(500)));
        assert!(mcp.reservoir.is_some());
        assert_eq!(concurrency.limits_for("unknown"), ConcurrencyLimits::new(5));
    }

    #[test]
    fn test_context_builder() {
        let ctx = RoutingContext::new(TaskType::Security)
            .with_priority(RoutingPriority::Quality)
            .with_tools()
            .with_unrestricted()
            .with_preferred_model("mcp/dolphin-3");
        assert_eq!(ctx.task_type, TaskType::Security);
        assert!(ctx.requires_tools);
        assert!(!ctx.requires_vision);
        assert!(ctx.requires_unrestricted);
        assert_eq!(ctx.preferred_model.as_deref(), Some("mcp/dolphin-3"));
    }
}
