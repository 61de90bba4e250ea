//! Routing Policy
//!
//! Model profiles and the scoring used by single-provider routing to pick a
//! provider/model pair for a request.
//!
//! # Scoring
//!
//! ```text
//! +10  model declares the requested task type
//! +0..10  priority term (speed / quality / cost table, or their mean for balanced)
//! +5   unrestricted required and declared
//! +5   multilingual required and model declares multilingual or chinese
//! +8   task is debugging/reasoning and model declares agentic
//! ```
//!
//! Highest score wins; equal scores keep catalog order. A model lacking a
//! required unrestricted or multilingual trait is not a candidate at all.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::{RoutingContext, RoutingPriority, TaskType};

// ============================================================================
// Model Traits
// ============================================================================

/// Something a model is declared to be good at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    General,
    Coding,
    Security,
    Reasoning,
    Creative,
    Writing,
    ReverseEngineering,
    Chinese,
    Debugging,
    Multilingual,
    Unrestricted,
    Agentic,
    Autonomous,
    FastResponse,
}

impl From<TaskType> for Capability {
    fn from(task: TaskType) -> Self {
        match task {
            TaskType::General => Capability::General,
            TaskType::Coding => Capability::Coding,
            TaskType::Security => Capability::Security,
            TaskType::Reasoning => Capability::Reasoning,
            TaskType::Creative => Capability::Creative,
            TaskType::Writing => Capability::Writing,
            TaskType::ReverseEngineering => Capability::ReverseEngineering,
            TaskType::Chinese => Capability::Chinese,
            TaskType::Debugging => Capability::Debugging,
        }
    }
}

/// Response speed tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeedTier {
    VeryFast,
    Fast,
    Medium,
    Slow,
}

impl SpeedTier {
    pub fn score(&self) -> f64 {
        match self {
            SpeedTier::VeryFast => 10.0,
            SpeedTier::Fast => 7.0,
            SpeedTier::Medium => 4.0,
            SpeedTier::Slow => 0.0,
        }
    }
}

/// Output quality tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityTier {
    Exceptional,
    High,
    Good,
    Basic,
}

impl QualityTier {
    pub fn score(&self) -> f64 {
        match self {
            QualityTier::Exceptional => 10.0,
            QualityTier::High => 7.0,
            QualityTier::Good => 4.0,
            QualityTier::Basic => 0.0,
        }
    }
}

/// Cost tier (cheaper scores higher)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CostTier {
    VeryLow,
    Low,
    Medium,
    High,
}

impl CostTier {
    pub fn score(&self) -> f64 {
        match self {
            CostTier::VeryLow => 10.0,
            CostTier::Low => 7.0,
            CostTier::Medium => 4.0,
            CostTier::High => 0.0,
        }
    }
}

// ============================================================================
// Model Profile
// ============================================================================

/// Declared traits of one provider/model pair
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Provider registry name
    pub provider: String,
    /// Provider-specific model id
    pub model: String,
    pub capabilities: Vec<Capability>,
    pub speed: SpeedTier,
    pub quality: QualityTier,
    pub cost: CostTier,
}

impl ModelProfile {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        capabilities: &[Capability],
        speed: SpeedTier,
        quality: QualityTier,
        cost: CostTier,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            capabilities: capabilities.to_vec(),
            speed,
            quality,
            cost,
        }
    }

    /// `provider/model`
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

// ============================================================================
// Model Catalog
// ============================================================================

/// Ordered set of known model profiles
#[derive(Clone, Debug, PartialEq)]
pub struct ModelCatalog {
    profiles: Vec<ModelProfile>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        use Capability::*;
        use CostTier as C;
        use QualityTier as Q;
        use SpeedTier as S;

        let profiles = vec![
            // Local MCP lineup
            ModelProfile::new("mcp", "dolphin-3", &[Coding, Security, ReverseEngineering, Unrestricted], S::Fast, Q::High, C::Low),
            ModelProfile::new("mcp", "qwen-72b", &[Reasoning, Coding, Writing, Unrestricted], S::Medium, Q::Exceptional, C::Medium),
            ModelProfile::new("mcp", "whiterabbit", &[Coding, Creative, Unrestricted], S::VeryFast, Q::Good, C::VeryLow),
            ModelProfile::new("mcp", "llama-fast", &[General, FastResponse, Unrestricted], S::VeryFast, Q::Good, C::VeryLow),
            ModelProfile::new("mcp", "llama-70b", &[Reasoning, Coding, Writing, Unrestricted], S::Medium, Q::Exceptional, C::Medium),
            ModelProfile::new("mcp", "kimi-k2", &[Agentic, Coding, Autonomous, Reasoning, Unrestricted], S::Fast, Q::Exceptional, C::Medium),
            ModelProfile::new("mcp", "glm-4.7", &[Reasoning, Coding, Chinese, Multilingual], S::Fast, Q::High, C::Low),
            // Anthropic lineup
            ModelProfile::new("anthropic", "claude-opus-4-1", &[Reasoning, Coding, Writing, Creative], S::Medium, Q::Exceptional, C::High),
            ModelProfile::new("anthropic", "claude-sonnet-4-5", &[Reasoning, Coding, Writing, General], S::Fast, Q::High, C::Medium),
            ModelProfile::new("anthropic", "claude-haiku-4-5", &[General, Coding, FastResponse], S::VeryFast, Q::Good, C::Low),
        ];
        Self { profiles }
    }
}

impl ModelCatalog {
    /// An empty catalog
    #[must_use]
    pub fn empty() -> Self {
        Self {
            profiles: Vec::new(),
        }
    }

    pub fn from_profiles(profiles: Vec<ModelProfile>) -> Self {
        Self { profiles }
    }

    /// Add a profile, replacing an existing one for the same pair in place
    pub fn upsert(&mut self, profile: ModelProfile) {
        match self
            .profiles
            .iter_mut()
            .find(|p| p.provider == profile.provider && p.model == profile.model)
        {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn profiles(&self) -> &[ModelProfile] {
        &self.profiles
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelProfile> {
        self.profiles
            .iter()
            .find(|p| p.provider == provider && p.model == model)
    }

    /// First profile with the given bare model id
    pub fn find_model(&self, model: &str) -> Option<&ModelProfile> {
        self.profiles.iter().find(|p| p.model == model)
    }

    pub fn for_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a ModelProfile> {
        self.profiles.iter().filter(move |p| p.provider == provider)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// A profile with its score for one request
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredCandidate {
    pub profile: ModelProfile,
    pub score: f64,
}

/// Score a profile against a routing context
pub fn score_candidate(profile: &ModelProfile, context: &RoutingContext) -> f64 {
    let mut score = 0.0;

    if profile.has(Capability::from(context.task_type)) {
        score += 10.0;
    }

    score += match context.priority {
        RoutingPriority::Speed => profile.speed.score(),
        RoutingPriority::Quality => profile.quality.score(),
        RoutingPriority::Cost => profile.cost.score(),
        RoutingPriority::Balanced => {
            (profile.speed.score() + profile.quality.score() + profile.cost.score()) / 3.0
        }
    };

    if context.requires_unrestricted && profile.has(Capability::Unrestricted) {
        score += 5.0;
    }

    if context.requires_multilingual
        && (profile.has(Capability::Multilingual) || profile.has(Capability::Chinese))
    {
        score += 5.0;
    }

    if context.task_type.prefers_agentic() && profile.has(Capability::Agentic) {
        score += 8.0;
    }

    score
}

/// Whether a profile carries the traits the context insists on
pub fn meets_requirements(profile: &ModelProfile, context: &RoutingContext) -> bool {
    if context.requires_unrestricted && !profile.has(Capability::Unrestricted) {
        return false;
    }
    if context.requires_multilingual
        && !profile.has(Capability::Multilingual)
        && !profile.has(Capability::Chinese)
    {
        return false;
    }
    true
}

/// Score and order candidates, best first; ties keep input order
pub fn rank_candidates<'a, I>(candidates: I, context: &RoutingContext) -> Vec<ScoredCandidate>
where
    I: IntoIterator<Item = &'a ModelProfile>,
{
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|profile| ScoredCandidate {
            score: score_candidate(profile, context),
            profile: profile.clone(),
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

/// The best candidate, if any
pub fn select_best<'a, I>(candidates: I, context: &RoutingContext) -> Option<ScoredCandidate>
where
    I: IntoIterator<Item = &'a ModelProfile>,
{
    rank_candidates(candidates, context).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_meets_requirements() {
        let catalog = ModelCatalog::default();
        let glm = catalog.get("mcp", "glm-4.7").expect("glm in catalog");
        let dolphin = catalog.get("mcp", "dolphin-3").expect("dolphin in catalog");

        let multilingual = RoutingContext::default().with_multilingual();
        assert!(meets_requirements(glm, &multilingual));
        assert!(!meets_requirements(dolphin, &multilingual));

        let unrestricted = RoutingContext::default().with_unrestricted();
        assert!(!meets_requirements(glm, &unrestricted));
        assert!(meets_requirements(dolphin, &unrestricted));

        assert!(meets_requirements(glm, &RoutingContext::default()));
    }

    #[test]
    fn test_default_catalog_contents() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.len(), 10);
        assert_eq!(catalog.for_provider("mcp").count(), 7);

        let kimi = catalog.get("mcp", "kimi-k2").expect("kimi-k2 should exist");
        assert!(kimi.has(Capability::Agentic));
        assert_eq!(kimi.id(), "mcp/kimi-k2");
        assert_eq!(
            catalog.find_model("claude-haiku-4-5").map(|p| p.provider.as_str()),
            Some("anthropic")
        );
    }

    #[test]
    fn test_score_terms() {
        let catalog = ModelCatalog::default();
        let glm = catalog.get("mcp", "glm-4.7").expect("glm should exist");

        // +10 task, (7 + 7 + 7) / 3 balanced, +5 multilingual
        let ctx = RoutingContext::new(TaskType::Chinese).with_multilingual();
        assert!((score_candidate(glm, &ctx) - 22.0).abs() < 1e-9);

        let ctx = RoutingContext::new(TaskType::Creative).with_priority(RoutingPriority::Cost);
        assert!((score_candidate(glm, &ctx) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_agentic_bonus_for_debugging() {
        let catalog = ModelCatalog::default();
        let ctx = RoutingContext::new(TaskType::Debugging).with_priority(RoutingPriority::Quality);
        let best = select_best(catalog.profiles(), &ctx).expect("catalog is not empty");
        assert_eq!(best.profile.id(), "mcp/kimi-k2");
        assert!((best.score - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_speed_priority_prefers_fast_coders() {
        let catalog = ModelCatalog::default();
        let ctx = RoutingContext::new(TaskType::Coding).with_priority(RoutingPriority::Speed);
        let ranked = rank_candidates(catalog.profiles(), &ctx);
        // whiterabbit and haiku both score 20; whiterabbit comes first in the catalog
        assert_eq!(ranked[0].profile.id(), "mcp/whiterabbit");
        assert_eq!(ranked[1].profile.id(), "anthropic/claude-haiku-4-5");
    }

    #[test]
    fn test_ties_keep_input_order() {
        let make = |model: &str| {
            ModelProfile::new(
                "p",
                model,
                &[Capability::General],
                SpeedTier::Fast,
                QualityTier::Good,
                CostTier::Low,
            )
        };
        let profiles = vec![make("a"), make("b"), make("c")];
        let ranked = rank_candidates(&profiles, &RoutingContext::default());
        let order: Vec<&str> = ranked.iter().map(|c| c.profile.model.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut catalog = ModelCatalog::default();
        let mut sonnet = catalog
            .get("anthropic", "claude-sonnet-4-5")
            .cloned()
            .expect("sonnet should exist");
        sonnet.cost = CostTier::Low;
        catalog.upsert(sonnet);
        assert_eq!(catalog.len(), 10);
        assert_eq!(
            catalog.get("anthropic", "claude-sonnet-4-5").map(|p| p.cost),
            Some(CostTier::Low)
        );

        catalog.upsert(ModelProfile::new(
            "featherless",
            "llama-70b",
            &[Capability::Reasoning],
            SpeedTier::Medium,
            QualityTier::High,
            CostTier::Low,
        ));
        assert_eq!(catalog.len(), 11);
    }

    #[test]
    fn test_select_from_empty() {
        assert!(select_best(ModelCatalog::empty().profiles(), &RoutingContext::default()).is_none());
    }
}
