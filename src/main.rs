mod api;
mod archive;
mod config;
mod db;
mod error;
mod fetcher;
mod query;
mod scheduler;
mod snapshots;
mod state;
mod types;
mod upstream;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::archive::Archiver;
use crate::config::Config;
use crate::db::MemberDirectory;
use crate::error::Result;
use crate::fetcher::UpstreamFetcher;
use crate::query::{DeltaEngine, GrowthRanker};
use crate::scheduler::DailyScheduler;
use crate::snapshots::SnapshotStore;
use crate::state::RankingCache;
use crate::upstream::{http_client, RateLimiter, TokenBroker};

#[derive(Parser, Debug)]
#[command(name = "scout")]
#[command(about = "Daily member roster archive with rating delta and growth queries")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daily scheduler and the HTTP API (default)
    Serve,
    /// Fetch and archive today's snapshot once, then exit
    Fetch {
        /// Only this category; all configured categories when omitted
        #[arg(long)]
        category: Option<String>,
    },
    /// Refresh the member directory from the latest snapshots
    SyncMembers,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    let result = match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cfg).await,
        Commands::Fetch { category } => fetch_once(cfg, category).await,
        Commands::SyncMembers => sync_members(cfg).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

/// Components shared by every command that talks to upstream.
struct Services {
    store: Arc<SnapshotStore>,
    cache: Arc<RankingCache>,
    health: Arc<HealthState>,
    broker: Arc<TokenBroker>,
    archiver: Arc<Archiver>,
}

impl Services {
    fn build(cfg: &Config) -> Result<Self> {
        let http = http_client(cfg.http_timeout)?;
        let broker = Arc::new(TokenBroker::new(
            http.clone(),
            cfg.token_url.clone(),
            cfg.credentials()?,
            cfg.token_safety_margin,
        ));
        let limiter = Arc::new(
            RateLimiter::new(cfg.rate_limit_rpm, cfg.rate_limit_burst)
                .with_max_wait(cfg.rate_limit_max_wait),
        );
        let fetcher = Arc::new(UpstreamFetcher::new(
            http,
            Arc::clone(&broker),
            limiter,
            cfg.data_url_template.clone(),
        ));

        let store = Arc::new(SnapshotStore::new(cfg.snapshots_dir.clone()));
        let cache = Arc::new(RankingCache::new(cfg.utc_offset()));
        let health = Arc::new(HealthState::new());
        let archiver = Arc::new(Archiver::new(
            fetcher,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&health),
            cfg.categories.clone(),
            cfg.utc_offset(),
        ));

        Ok(Self {
            store,
            cache,
            health,
            broker,
            archiver,
        })
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    let services = Services::build(&cfg)?;
    let directory = MemberDirectory::connect(&cfg.db_path).await?;
    info!(
        "Archiving {} categories into {}",
        cfg.categories.len(),
        cfg.snapshots_dir.display()
    );

    // Daily fetch
    if cfg.scheduler_enabled {
        let scheduler = DailyScheduler::new(
            Arc::clone(&services.archiver),
            cfg.schedule_hour,
            cfg.schedule_minute,
            cfg.utc_offset(),
        );
        tokio::spawn(async move { scheduler.run().await });
    } else {
        warn!("Scheduler disabled via SCHEDULER_ENABLED; snapshots only come from manual fetches");
    }

    // HTTP API server
    let api_state = ApiState {
        cfg: Arc::clone(&cfg),
        store: Arc::clone(&services.store),
        deltas: Arc::new(DeltaEngine::new(Arc::clone(&services.store))),
        growers: Arc::new(GrowthRanker::new(
            Arc::clone(&services.store),
            Arc::clone(&services.cache),
        )),
        archiver: services.archiver,
        directory,
        health: services.health,
        broker: services.broker,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn fetch_once(cfg: Config, category: Option<String>) -> Result<()> {
    let category = match category.as_deref() {
        Some(raw) => Some(cfg.resolve_category(Some(raw))?),
        None => None,
    };
    let services = Services::build(&cfg)?;
    let report = services.archiver.fetch_and_archive(category.as_ref()).await?;

    for (category, rows) in &report.counts {
        println!("{category}: {rows} rows stored for {}", report.snapshot_date);
    }
    for (category, reason) in &report.failures {
        println!("{category}: FAILED ({reason})");
    }
    if !report.is_success() {
        return Err(error::AppError::Upstream(format!(
            "{} of {} categories failed",
            report.failures.len(),
            report.failures.len() + report.counts.len()
        )));
    }
    Ok(())
}

async fn sync_members(cfg: Config) -> Result<()> {
    let store = SnapshotStore::new(cfg.snapshots_dir.clone());
    let directory = MemberDirectory::connect(&cfg.db_path).await?;
    let upserted = directory
        .sync_from_snapshots(&store, &cfg.categories, cfg.today())
        .await?;
    println!("{upserted} members upserted, {} in directory", directory.count().await?);
    Ok(())
}
