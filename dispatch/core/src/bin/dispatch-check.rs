//! Dispatch Check
//!
//! Operator tool for the dispatch router. Loads the effective configuration,
//! prints it, and shows which model the scorer would pick for a request shape.
//!
//! # Usage
//!
//! ```bash
//! # Effective config and the pick for a general request
//! dispatch-check
//!
//! # Debugging task, quality first, tool calling required
//! dispatch-check --task debugging --priority quality --require-tools
//!
//! # Route one request through mock providers to exercise admission and fallback
//! dispatch-check --simulate
//!
//! # With verbose logging (RUST_LOG wins over --log-level)
//! RUST_LOG=dispatch_core=debug dispatch-check --simulate
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dispatch_core::backend::{CompletionRequest, MockProvider, ProviderCapabilities, ProviderRegistry};
use dispatch_core::config::{load_config_from_path, default_config_path, ConfigOverrides, DispatchConfig};
use dispatch_core::routing::{meets_requirements, rank_candidates, ModelCatalog, Router, RoutingContext, RoutingPriority, TaskType};

#[derive(Debug, Parser)]
#[command(name = "dispatch-check", version, about = "Inspect dispatch routing configuration")]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/dispatch/dispatch.toml)
    #[arg(long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Task type of the request shape
    #[arg(long, default_value = "general")]
    task: TaskType,

    /// Routing priority of the request shape
    #[arg(long, default_value = "balanced")]
    priority: RoutingPriority,

    #[arg(long)]
    require_vision: bool,

    #[arg(long)]
    require_tools: bool,

    #[arg(long)]
    require_unrestricted: bool,

    #[arg(long)]
    require_multilingual: bool,

    /// Explicit `provider/model` or bare model id
    #[arg(long)]
    model: Option<String>,

    /// Route in single-provider mode instead of the fallback chain
    #[arg(long)]
    single: bool,

    /// Route one request through mock providers
    #[arg(long)]
    simulate: bool,
}

impl Args {
    fn context(&self) -> RoutingContext {
        let mut context = RoutingContext::new(self.task).with_priority(self.priority);
        if self.require_vision {
            context = context.with_vision();
        }
        if self.require_tools {
            context = context.with_tools();
        }
        if self.require_unrestricted {
            context = context.with_unrestricted();
        }
        if self.require_multilingual {
            context = context.with_multilingual();
        }
        if let Some(model) = &self.model {
            context = context.with_preferred_model(model.clone());
        }
        context
    }
}

fn print_config(config: &DispatchConfig) {
    println!("Configuration (source: {})", config.source());
    match &config.config_file_path {
        Some(path) => println!("  file: {}", path.display()),
        None => println!("  file: none"),
    }

    let router = &config.router;
    println!("  mode: {}", if router.use_fallback { "fallback" } else { "single" });
    println!("  fallback admission: {}", router.fallback_admission);
    println!("  token timeout: {}ms", router.token_timeout.as_millis());
    match router.permit_timeout {
        Some(timeout) => println!("  permit timeout: {}ms", timeout.as_millis()),
        None => println!("  permit timeout: none"),
    }
    println!(
        "  default model: {}",
        router.default_model.as_deref().unwrap_or("none")
    );
    println!(
        "  retry: max {} initial {}ms max {}ms factor {}",
        router.backoff.max_retries,
        router.backoff.initial_delay.as_millis(),
        router.backoff.max_delay.as_millis(),
        router.backoff.factor
    );

    let providers: BTreeSet<&str> = config
        .rate_limits
        .providers
        .keys()
        .chain(config.concurrency.providers.keys())
        .map(String::as_str)
        .collect();
    println!("  providers:");
    for provider in providers {
        let limits = config.concurrency.limits_for(provider);
        let spacing = limits
            .min_time_between
            .map(|d| format!(" spacing {}ms", d.as_millis()))
            .unwrap_or_default();
        let reservoir = limits
            .reservoir
            .map(|r| format!(" reservoir {}/{}ms", r.capacity, r.refresh_interval.as_millis()))
            .unwrap_or_default();
        println!(
            "    {provider}: {} rpm, {} concurrent{spacing}{reservoir}",
            config.rate_limits.limit_for(provider),
            limits.max_concurrent
        );
    }

    println!("  fallback chain:");
    let mut chain = config.fallback.clone();
    chain.sort_by_key(|c| c.priority);
    for candidate in &chain {
        println!(
            "    {}. {} ({} attempts, {}ms{})",
            candidate.priority,
            candidate.id(),
            candidate.max_retries,
            candidate.retry_delay.as_millis(),
            if candidate.use_exponential_backoff { ", exponential" } else { "" }
        );
    }
}

fn build_catalog(config: &DispatchConfig) -> ModelCatalog {
    let mut catalog = ModelCatalog::default();
    for profile in &config.models {
        catalog.upsert(profile.clone());
    }
    catalog
}

async fn simulate(config: &DispatchConfig, catalog: &ModelCatalog, context: &RoutingContext) -> anyhow::Result<()> {
    let names: BTreeSet<String> = catalog
        .profiles()
        .iter()
        .map(|p| p.provider.clone())
        .chain(config.fallback.iter().map(|c| c.provider.clone()))
        .collect();

    let registry = Arc::new(ProviderRegistry::new());
    for name in names {
        registry.register(Arc::new(
            MockProvider::new(name).with_capabilities(ProviderCapabilities::full()),
        ));
    }

    let router = Router::from_config(registry, config);
    let request = CompletionRequest::new("dispatch-check simulated request");
    let response = router.route(&request, context).await?;
    println!("Simulated route: {} -> {:?}", response.model, response.content);

    let summary = router.metrics().summary();
    for (provider, metrics) in &summary.providers {
        println!(
            "  {provider}: {} requests, {} failures, {} admission timeouts",
            metrics.requests, metrics.failures, metrics.admission_timeouts
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&args.log_level)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path)?;

    let mut overrides = ConfigOverrides::new();
    if args.single {
        overrides = overrides.with_use_fallback(false);
    }
    overrides.apply(&mut config);
    config.validate()?;

    info!(source = %config.source(), "Configuration loaded");
    print_config(&config);

    let context = args.context();
    let catalog = build_catalog(&config);
    let eligible = catalog
        .profiles()
        .iter()
        .filter(|profile| meets_requirements(profile, &context));
    let ranked = rank_candidates(eligible, &context);

    println!();
    println!("Ranking for {} / {}:", context.task_type, context.priority);
    for (i, candidate) in ranked.iter().take(5).enumerate() {
        println!("  {}. {} ({:.2})", i + 1, candidate.profile.id(), candidate.score);
    }
    if ranked.is_empty() {
        println!("  no candidates");
    }

    if args.simulate {
        println!();
        simulate(&config, &catalog, &context).await?;
    }

    Ok(())
}
