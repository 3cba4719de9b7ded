//! feed-harvester command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feed_harvester::core::config::load_config;
use feed_harvester::core::error::CrawlStage;
use feed_harvester::persistence::{PoolConfig, PooledRecordSink, ResourcePool, RestStoreFactory};
use feed_harvester::proxy_preflight::ProxyPreflightValidator;
use feed_harvester::scraping::chromium::ChromiumDriver;
use feed_harvester::{CrawlOrchestrator, HarvestConfig, SourceList};

const EXIT_CRAWL_FAILED: i32 = 1;
const EXIT_PREFLIGHT_FAILED: i32 = 2;

/// Harvest timeline posts from authenticated feeds into a remote store.
#[derive(Parser, Debug)]
#[command(name = "feed-harvester", version, about, long_about = None)]
struct Cli {
    /// Path to harvester.json (defaults: $FEED_HARVESTER_CONFIG, ./harvester.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the configured lists (all of them unless --list is given)
    Crawl {
        /// List id to crawl; repeatable
        #[arg(short, long = "list", value_name = "ID")]
        lists: Vec<String>,
    },
    /// Check the configured proxy and exit
    Preflight,
    /// Print the most recent stored records for a list
    Recent {
        #[arg(short, long = "list", value_name = "ID")]
        list: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

fn setup_logging(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info,chromiumoxide=warn",
        (false, 1) => "debug,chromiumoxide=info,hyper=info",
        (false, _) => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn select_lists(config: &HarvestConfig, ids: &[String]) -> Result<Vec<SourceList>> {
    if ids.is_empty() {
        if config.lists.is_empty() {
            return Err(anyhow!("no lists configured; add entries under \"lists\" in harvester.json"));
        }
        return Ok(config.lists.clone());
    }
    ids.iter()
        .map(|id| {
            config
                .list(id)
                .cloned()
                .ok_or_else(|| anyhow!("unknown list id '{}'", id))
        })
        .collect()
}

fn store_pool(config: &HarvestConfig) -> Result<ResourcePool<RestStoreFactory>> {
    let factory =
        RestStoreFactory::from_settings(&config.store).context("store is not configured")?;
    Ok(ResourcePool::new(factory, PoolConfig::from(&config.pool)))
}

async fn crawl(config: HarvestConfig, ids: &[String]) -> Result<i32> {
    let lists = select_lists(&config, ids)?;
    let pool = store_pool(&config)?;
    let sink = Arc::new(PooledRecordSink::new(
        pool.clone(),
        config.store.table.clone(),
        config.store.conflict_key.clone(),
    ));

    let orchestrator = CrawlOrchestrator::new(config, Arc::new(ChromiumDriver), sink);
    let cancel = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current iteration");
            cancel.cancel();
        }
    });

    let results = orchestrator.run_all(&lists).await;
    info!("pool at exit: {:?}", pool.stats());
    pool.shutdown().await;

    let mut code = 0;
    for (list_id, result) in &results {
        match result {
            Ok(report) => println!("{}", serde_json::to_string(report)?),
            Err(e) => {
                error!(list = %list_id, "{}", e);
                let stage = e.stage();
                code = if stage == Some(CrawlStage::Preflight) {
                    EXIT_PREFLIGHT_FAILED
                } else {
                    code.max(EXIT_CRAWL_FAILED)
                };
            }
        }
    }
    Ok(code)
}

async fn preflight(config: &HarvestConfig) -> Result<i32> {
    let validator = ProxyPreflightValidator::from_settings(&config.proxy);
    let result = validator.validate_configured(&config.proxy.resolve()).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.success { 0 } else { EXIT_PREFLIGHT_FAILED })
}

async fn recent(config: &HarvestConfig, list: &str, limit: usize) -> Result<i32> {
    let pool = store_pool(config)?;
    let sink = PooledRecordSink::new(
        pool.clone(),
        config.store.table.clone(),
        config.store.conflict_key.clone(),
    );
    let rows = sink
        .recent(list, limit)
        .await
        .with_context(|| format!("failed to read recent records for '{}'", list))?;
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    pool.shutdown().await;
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    let config = load_config(cli.config.as_deref())
        .validate()
        .context("invalid configuration")?;

    let code = match &cli.command {
        Command::Crawl { lists } => crawl(config, lists).await?,
        Command::Preflight => preflight(&config).await?,
        Command::Recent { list, limit } => recent(&config, list, *limit).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
