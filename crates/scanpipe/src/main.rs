mod adapters;
mod api;
mod config;
mod db;
mod enrichment;
mod error;
mod jobs;
mod models;
mod parser;
mod security;
mod severity;
mod store;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::sync::{mpsc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    adapters::ProcessWorker,
    config::AppConfig,
    enrichment::EnrichmentAdapter,
    jobs::{worker_loop, QueuedScan, RateLimiter, ReportLifecycle, ScanPipeline},
    severity::SeverityTable,
    store::SqliteReportStore,
};

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ReportLifecycle,
    pub queue: mpsc::Sender<QueuedScan>,
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteReportStore::new(pool));
    let lifecycle = ReportLifecycle::new(store, SeverityTable::builtin());

    let enrichment = if config.enrichment.enabled {
        let adapter = EnrichmentAdapter::from_config(&config.enrichment)
            .context("failed to build enrichment client")?;
        Some(Arc::new(adapter))
    } else {
        warn!("enrichment disabled; reports will not carry an enhanced section");
        None
    };

    let pipeline = Arc::new(ScanPipeline::new(
        Arc::new(ProcessWorker::new(&config.worker)),
        lifecycle.clone(),
        enrichment,
    ));

    let (tx, rx) = mpsc::channel(128);
    tokio::spawn(worker_loop(pipeline, rx, config.max_concurrent_scans));

    let state = AppState {
        lifecycle,
        queue: tx,
        config: config.clone(),
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(config.create_rate_per_minute))),
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, worker = %config.worker.program, "scanpipe listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
