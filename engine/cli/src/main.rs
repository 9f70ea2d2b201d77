//! Iris CLI
//!
//! Operator front end for the iris engine: loads a TOML config, wires the
//! configured HTTP backends and sources, and routes one query through a
//! named profile.
//!
//! # Usage
//!
//! ```bash
//! # Answer a query with the "smart" profile
//! iris route --profile smart "What is the inflation rate in Sweden?"
//!
//! # Validate a config file
//! iris check-config --config engine/config/iris.example.toml
//!
//! # With verbose logging
//! RUST_LOG=debug iris route "..."
//! ```
//!
//! # Environment Variables
//!
//! - `IRIS_CONFIG`: Config file path (default: `~/.config/iris/engine.toml`)
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGINT: Cancels the in-flight route

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{debug, info, warn};

use iris_engine::{EngineConfig, RequestRouter};

#[derive(Debug, Parser)]
#[command(name = "iris", version, about = "Resilient multi-provider question answering")]
struct Cli {
    /// Config file (falls back to ~/.config/iris/engine.toml)
    #[arg(long, short, global = true, env = "IRIS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Route a query through a profile and print the response as JSON
    Route {
        /// Profile to use
        #[arg(long, short, default_value = "smart")]
        profile: String,

        /// The question
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Load and validate the config, then print a summary
    CheckConfig,
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    path: String,
    profiles: Vec<ProfileSummary>,
    backends: Vec<String>,
    sources: Vec<String>,
    breaker_overrides: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProfileSummary {
    name: String,
    chain: Vec<String>,
    sources: Vec<String>,
}

fn sorted_keys<V>(map: &std::collections::HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    explicit
        .or_else(EngineConfig::default_path)
        .context("no --config given and no config directory found for this platform")
}

async fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    EngineConfig::load(path)
        .await
        .with_context(|| format!("loading config from {}", path.display()))
}

async fn route(config: EngineConfig, profile: &str, query: &str) -> anyhow::Result<()> {
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("building HTTP client")?;

    let mut router = RequestRouter::new(Arc::new(config));
    router.register_http_backends(&http_client);

    let plan = router.plan_for_profile(profile)?;
    info!(
        profile = %profile,
        chain = ?plan.chain.ids(),
        sources = ?plan.sources,
        "Resolved route plan"
    );

    let response = tokio::select! {
        response = router.route(&plan, query) => response,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, cancelling route");
            anyhow::bail!("route cancelled");
        }
    };

    for snapshot in router.registry().snapshots() {
        debug!(
            service = %snapshot.service_id,
            state = %snapshot.state,
            failures = snapshot.failure_count,
            severity = ?snapshot.severity,
            "Breaker state"
        );
    }

    if response.analysis.is_degraded() {
        warn!(
            backend = %response.analysis.backend_id,
            served_by = ?response.analysis.served_by,
            "Answer served in degraded mode"
        );
    }

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn summarize(path: &Path, config: &EngineConfig) -> ConfigSummary {
    let profiles = config
        .profile_names()
        .into_iter()
        .filter_map(|name| {
            config.profile(name).map(|profile| ProfileSummary {
                name: name.to_string(),
                chain: profile
                    .ordered_chain()
                    .iter()
                    .map(|entry| entry.backend_id.clone())
                    .collect(),
                sources: profile.selected_sources(),
            })
        })
        .collect();

    ConfigSummary {
        path: path.display().to_string(),
        profiles,
        backends: sorted_keys(&config.backends),
        sources: sorted_keys(&config.sources),
        breaker_overrides: sorted_keys(&config.breakers),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("iris_cli=info".parse()?)
                .add_directive("iris_engine=info".parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config)?;
    let config = load_config(&config_path).await?;

    match cli.command {
        Command::Route { profile, query } => route(config, &profile, &query.join(" ")).await,
        Command::CheckConfig => {
            let summary = summarize(&config_path, &config);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            info!(path = %config_path.display(), "Config is valid");
            Ok(())
        }
    }
}
