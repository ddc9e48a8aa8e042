mod sources;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use arachne_client::{HttpClient, RuleHub, TransportConfig, rule_hub};
use arachne_core::config::ArachneConfig;
use arachne_core::search::SearchRequest;

#[derive(Parser)]
#[command(name = "arachne", version, about = "Federated resolver engine")]
struct Cli {
    /// JSON source list of packages to load before running the command
    #[arg(short, long, global = true, env = "ARACHNE_SOURCES")]
    sources: Option<PathBuf>,

    /// Proxy for every request (http, https or socks5 URL)
    #[arg(long, global = true, env = "ARACHNE_PROXY")]
    proxy: Option<String>,

    /// Accept invalid TLS certificates
    #[arg(long, global = true, env = "ARACHNE_TRUST_ALL_CERTS", default_value_t = false)]
    insecure: bool,

    /// Redirect a host: `from=to[:port]`, `from` may be `*.suffix`
    #[arg(long = "host", global = true, value_parser = parse_host_mapping)]
    hosts: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every searchable resolver and stream results as they arrive
    Search {
        keyword: String,

        /// Only query these resolvers (repeatable)
        #[arg(short, long = "resolver")]
        resolvers: Vec<String>,

        /// Only query resolvers that allow quick search
        #[arg(long, default_value_t = false)]
        quick: bool,

        /// Maximum resolvers queried at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Per-resolver timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Show a resolver's home listing
    Home {
        key: String,
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },

    /// List one page of a category
    Category {
        key: String,
        type_id: String,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        /// Filter value `name=value` (repeatable)
        #[arg(short, long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },

    /// Show details for one or more item ids
    Detail {
        key: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Resolve a playable source for an episode
    Play {
        key: String,
        #[arg(short, long)]
        flag: String,
        #[arg(short, long)]
        id: String,
    },

    /// List loaded plugins
    Plugins,

    /// Check a plugin's source for a newer package
    CheckUpdate { key: String },

    /// Download, validate and swap in a plugin's newer package
    Update { key: String },

    /// Run home and a test search against one resolver
    Probe {
        key: String,
        #[arg(short, long, default_value = "test")]
        keyword: String,
    },

    /// Inspect or maintain the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache statistics
    Stats,
    /// Purge expired and corrupted entries
    Sweep,
    /// Remove every entry
    Clear,
}

fn parse_pair(raw: &str, what: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
            Ok((k.trim().to_string(), v.trim().to_string()))
        }
        _ => Err(format!("expected {what}, got '{raw}'")),
    }
}

fn parse_host_mapping(raw: &str) -> Result<(String, String), String> {
    parse_pair(raw, "from=to")
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    parse_pair(raw, "name=value")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("arachne=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let hub = build_hub(&cli).await?;
    let outcome = run(&hub, cli.command).await;
    hub.shutdown().await;
    outcome
}

async fn build_hub(cli: &Cli) -> Result<RuleHub> {
    let config = ArachneConfig::from_env().context("Invalid configuration")?;
    let transport = TransportConfig {
        timeout: config.call_timeout,
        proxy: cli.proxy.clone(),
        accept_invalid_certs: cli.insecure,
        ..TransportConfig::default()
    };
    let client = HttpClient::builder()
        .hosts(cli.hosts.iter().cloned().collect::<HashMap<_, _>>())
        .transport_config(transport)
        .build()
        .context("Failed to create HTTP client")?;

    let hub = rule_hub(config, client)
        .await
        .context("Failed to initialize resolver hub")?;

    if let Some(path) = &cli.sources {
        let specs = sources::read_sources(path)?;
        let total = specs.len();
        let mut loaded = 0;
        for (key, outcome) in hub.load_plugins(specs).await {
            match outcome {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(key = %key, error = %e, "Plugin failed to load"),
            }
        }
        tracing::info!(loaded, total, "Sources loaded");
    }
    Ok(hub)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(hub: &RuleHub, command: Commands) -> Result<()> {
    match command {
        Commands::Search {
            keyword,
            resolvers,
            quick,
            concurrency,
            timeout_ms,
        } => {
            let mut request = SearchRequest::new(keyword)
                .with_resolvers(resolvers)
                .quick(quick);
            if let Some(n) = concurrency {
                request = request.with_concurrency(n);
            }
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            cmd_search(hub, request).await
        }
        Commands::Home { key, refresh } => {
            print_json(&hub.home(&key, refresh).await.map_err(|e| anyhow!(e))?)
        }
        Commands::Category {
            key,
            type_id,
            page,
            filters,
            refresh,
        } => {
            let filters: BTreeMap<_, _> = filters.into_iter().collect();
            let listing = hub
                .category(&key, &type_id, page, filters, refresh)
                .await
                .map_err(|e| anyhow!(e))?;
            print_json(&listing)
        }
        Commands::Detail { key, ids } => {
            print_json(&hub.detail(&key, ids).await.map_err(|e| anyhow!(e))?)
        }
        Commands::Play { key, flag, id } => {
            let source = hub
                .player(&key, &flag, &id, Vec::new())
                .await
                .map_err(|e| anyhow!(e))?;
            print_json(&source)
        }
        Commands::Plugins => cmd_plugins(hub),
        Commands::CheckUpdate { key } => {
            print_json(&hub.check_for_update(&key).await.map_err(|e| anyhow!(e))?)
        }
        Commands::Update { key } => {
            let descriptor = hub.apply_update(&key).await.map_err(|e| anyhow!(e))?;
            println!(
                "{} is at version {} ({}...)",
                descriptor.key,
                descriptor.version,
                &descriptor.checksum[..8]
            );
            Ok(())
        }
        Commands::Probe { key, keyword } => {
            let report = hub.probe(&key, &keyword).await.map_err(|e| anyhow!(e))?;
            for check in &report.checks {
                let status = if check.success { "ok" } else { "FAILED" };
                println!(
                    "  [{}] {} — {} items in {} ms{}",
                    status,
                    check.capability,
                    check.items,
                    check.elapsed_ms,
                    check
                        .error
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                );
            }
            if !report.is_healthy() {
                bail!("Resolver '{key}' is not healthy");
            }
            Ok(())
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => print_json(&hub.cache_stats().await),
            CacheAction::Sweep => print_json(&hub.sweep_cache().await.map_err(|e| anyhow!(e))?),
            CacheAction::Clear => {
                hub.clear_cache().await.map_err(|e| anyhow!(e))?;
                println!("Cache cleared");
                Ok(())
            }
        },
    }
}

async fn cmd_search(hub: &RuleHub, request: SearchRequest) -> Result<()> {
    let mut handle = hub.search(request);
    tracing::info!(
        query_id = %handle.task().query_id,
        resolvers = handle.task().target_resolver_keys.len(),
        "Searching"
    );

    loop {
        tokio::select! {
            update = handle.next() => {
                let Some(update) = update else { break };
                let result = &update.result;
                let status = match (&result.error, result.cached) {
                    (Some(error), _) => format!("failed: {error}"),
                    (None, true) => format!("{} items (cached)", result.items.len()),
                    (None, false) => format!("{} items", result.items.len()),
                };
                eprintln!(
                    "[{}/{}] {} — {}",
                    update.progress.completed, update.progress.total, result.resolver_key, status
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Cancelling search");
                handle.cancel();
            }
        }
    }

    let summary = handle.finish().await;
    print_json(&summary)
}

fn cmd_plugins(hub: &RuleHub) -> Result<()> {
    let plugins = hub.plugins();
    if plugins.is_empty() {
        println!("No plugins loaded. Pass --sources <file> to load some.");
        return Ok(());
    }

    for plugin in &plugins {
        let capabilities: Vec<_> = plugin.entry_points.iter().map(|c| c.as_str()).collect();
        println!(
            "  {} — {} v{} [{}] {} (search: {}, quick: {})",
            plugin.key,
            plugin.display_name,
            plugin.version,
            plugin.safety,
            capabilities.join(","),
            plugin.searchable,
            plugin.quick_search,
        );
    }
    println!("\nTotal: {} plugins", plugins.len());
    Ok(())
}
