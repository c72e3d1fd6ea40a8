//! `eproutes`: two-level call-route trees over a tracing backend.
//!
//! This is a workspace tool intended to answer a simple question:
//! “Who calls into each endpoint of these services, and who calls the
//! callers?”
//!
//! Each requested service's endpoints become roots; for every root the
//! backend's call topology is resolved two hops upstream, with noisy
//! synthetic nodes filtered out and prefix-equivalent endpoints merged
//! into one canonical route.

mod engine;
mod query;
mod render;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use engine::{Aggregator, CacheKeyPolicy, EngineConfig, MergeRules, RouteMap, DEFAULT_SEARCH_LIMIT};
use query::{Duration, GraphqlClient};

const DEFAULT_URL: &str = "https://localhost:8080/graphql";

#[derive(Parser, Debug)]
#[command(name = "eproutes")]
#[command(about = "Endpoint call-route aggregation over a tracing backend")]
struct Cli {
    /// Service name to build routes for (repeatable).
    #[arg(short, long)]
    service: Vec<String>,

    /// Backend GraphQL endpoint (overrides the config file).
    #[arg(long)]
    url: Option<String>,

    /// JSON config file.
    ///
    /// Recognized keys: `url`, `headers` (static request headers),
    /// `services`, `merge_prefixes`, `filtered_nodes` (extra synthetic node
    /// names to exclude), `debug`.
    ///
    /// `merge_prefixes` maps a service name to an ordered rule list
    /// `[{"prefix": "...", "name": "..."}]`; the first matching prefix wins,
    /// and an empty `name` uses the prefix itself as the canonical name.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Query window start (backend default when empty).
    #[arg(long, default_value = "")]
    start: String,

    /// Query window end (backend default when empty).
    #[arg(long, default_value = "")]
    end: String,

    /// Query window step granularity; empty defaults to DAY.
    #[arg(long, default_value = "")]
    step: String,

    /// Max endpoints fetched per service.
    #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    search_limit: usize,

    /// Include the query window in dependency-cache keys.
    ///
    /// By default the cache is keyed by endpoint id only, so repeated runs
    /// in one process reuse caller sets across different windows.
    #[arg(long, default_value_t = false)]
    window_cache_key: bool,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Print traversal and request lines to stderr.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// On-disk configuration; every field is optional and CLI flags win.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    merge_prefixes: MergeRules,
    #[serde(default)]
    filtered_nodes: Vec<String>,
    #[serde(default)]
    debug: bool,
}

fn load_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };

    let mut services = file.services;
    services.extend(cli.service.iter().cloned());
    let mut seen = HashSet::new();
    services.retain(|s| seen.insert(s.clone()));
    if services.is_empty() {
        bail!("no services requested: pass --service or list them in the config file");
    }

    let debug = cli.debug || file.debug;
    let url = cli
        .url
        .clone()
        .or(file.url)
        .unwrap_or_else(|| DEFAULT_URL.to_string());

    let backend = GraphqlClient::new(url, file.headers, debug);
    let mut aggregator = Aggregator::new(
        backend,
        EngineConfig {
            merge_rules: file.merge_prefixes,
            extra_filtered_nodes: file.filtered_nodes,
            cache_policy: if cli.window_cache_key {
                CacheKeyPolicy::EndpointAndWindow
            } else {
                CacheKeyPolicy::EndpointOnly
            },
            search_limit: cli.search_limit,
            debug,
        },
    );

    let duration = Duration {
        start: cli.start,
        end: cli.end,
        step: cli.step,
    };
    let routes = aggregator.build_dependency_tree(&services, duration)?;

    match cli.format {
        OutputFormat::Text => print!("{}", render::render_routes(&routes)),
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct RoutesJsonOut<'a> {
                schema_version: u32,
                ok: bool,
                command: &'a str,
                services: &'a RouteMap,
            }
            let out = RoutesJsonOut {
                schema_version: 1,
                ok: true,
                command: "routes",
                services: &routes,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}
