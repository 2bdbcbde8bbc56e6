use anyhow::Result;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use violation_watch::api::{AppState, RestApi};
use violation_watch::config;
use violation_watch::db::DatabaseService;
use violation_watch::ingest::{IngestWatcher, ViolationPipeline};
use violation_watch::messaging::{broker::create_message_broker, LiveHub, ViolationEvents};
use violation_watch::services::{AnalyticsService, SubmissionService};

/// Config file from `CONFIG_PATH` or the first argument
fn config_path() -> Option<PathBuf> {
    std::env::var_os("CONFIG_PATH")
        .or_else(|| std::env::args_os().nth(1))
        .map(PathBuf::from)
}

async fn run_app() -> Result<()> {
    let config = config::load_config(config_path().as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.api.log_level.as_str()),
    )
    .init();
    info!("Starting violation-watch {}", env!("CARGO_PKG_VERSION"));

    let database = DatabaseService::new(&config.database).await?;
    let store = database.store.clone();
    info!("Database service initialized");

    // The broker relay is optional; the pipeline runs without it
    let events = if config.message_broker.enabled {
        match create_message_broker(config.message_broker.clone()).await {
            Ok(broker) => {
                info!("Message broker initialized");
                Some(Arc::new(ViolationEvents::new(broker)))
            }
            Err(e) => {
                warn!("Message broker unavailable, continuing without relay: {}", e);
                None
            }
        }
    } else {
        None
    };

    if let Some(events) = &events {
        if let Err(e) = events.system_startup().await {
            warn!("Failed to publish system startup event: {}", e);
        }
    }

    let hub = LiveHub::new(config.live.channel_capacity);

    let mut pipeline = ViolationPipeline::new(
        store.clone(),
        config.ingest.dedup_tolerance(),
        hub.clone(),
    );
    let mut watcher_events = None;
    if let Some(events) = &events {
        pipeline = pipeline.with_events(events.clone());
        watcher_events = Some(events.clone());
    }
    let pipeline = Arc::new(pipeline);

    let mut watcher = IngestWatcher::new(config.ingest.clone(), pipeline.clone());
    if let Some(events) = watcher_events {
        watcher = watcher.with_events(events);
    }
    let watcher = Arc::new(watcher);

    if config.ingest.enabled {
        watcher.start().await;
    } else {
        info!("Drop directory ingestion is disabled");
    }

    let state = AppState {
        store: store.clone(),
        analytics: Arc::new(AnalyticsService::new(store.clone())),
        submissions: Arc::new(SubmissionService::new(pipeline)),
        watcher: watcher.clone(),
        hub,
        events: events.clone(),
        live: config.live.clone(),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down...");
    };

    RestApi::new(&config.api, state).run(shutdown).await?;

    watcher.stop().await?;

    if let Some(events) = &events {
        if let Err(e) = events.system_shutdown().await {
            error!("Failed to publish shutdown event: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
