// =============================================================================
// Meridian Coordinator Node — Main Entry Point
// =============================================================================
//
// Hosts the full prediction lifecycle as cooperating workers over one shared
// store: feed ingest, predict dispatcher, score service, checkpoint builder
// and the HTTP read API. Workers stop cleanly on Ctrl+C via a shared stop
// signal.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backfill;
mod checkpoint;
mod config;
mod contract;
mod emission;
mod error;
mod events;
mod feed_worker;
mod feeds;
mod input_assembler;
mod merkle;
mod parquet_sink;
mod predict;
mod runner;
mod scoring;
mod store;
mod types;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::checkpoint::CheckpointService;
use crate::config::Config;
use crate::contract::ChallengeContract;
use crate::feed_worker::FeedDataWorker;
use crate::feeds::{create_feed, FeedSettings};
use crate::predict::PredictDispatcher;
use crate::runner::HttpModelRunner;
use crate::scoring::metrics::MetricsRegistry;
use crate::scoring::ScoreService;
use crate::types::{JsonMap, Schedule, ScheduledPredictionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Coordinator Node — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(Config::from_env());
    info!(
        provider = %config.feed_provider,
        subjects = ?config.feed_subjects,
        kind = %config.feed_kind,
        granularity = %config.feed_granularity,
        "configured feed scope"
    );

    let contract = Arc::new(ChallengeContract::starter(config.primary_subject()));

    // ── 2. Build shared state ────────────────────────────────────────────
    let feed = create_feed(
        &config.feed_provider,
        FeedSettings {
            poll_seconds: config.feed_poll_seconds,
        },
    )?;
    let state = AppState::build(config.clone(), contract.clone(), feed.clone())?;

    // ── 3. Seed the schedule registry ────────────────────────────────────
    let mut schedules = config.load_scheduled_configs()?;
    if schedules.is_empty() {
        // Without a seed file the node still dispatches on one default scope.
        schedules = vec![ScheduledPredictionConfig {
            id: "default".into(),
            scope_key: contract.scope_key.clone(),
            scope_template: JsonMap::new(),
            schedule: Schedule::default(),
            active: true,
            order: 0,
            meta: JsonMap::new(),
        }];
        info!("no schedule seed configured, using the default scope");
    }
    state.store.schedules.replace_all(schedules);

    let (stop_tx, stop_rx) = watch::channel(false);

    // ── 4. Feed-data worker ──────────────────────────────────────────────
    {
        let worker = FeedDataWorker::new(
            feed.clone(),
            state.store.feed_records.clone(),
            state.events.clone(),
            config.clone(),
        );
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            worker.run(stop).await;
        });
    }

    // ── 5. Predict dispatcher ────────────────────────────────────────────
    {
        let runner = Arc::new(HttpModelRunner::from_config(&config)?);
        let mut dispatcher = PredictDispatcher::new(
            state.store.clone(),
            state.assembler.clone(),
            runner,
            contract.clone(),
            state.events.clone(),
            config.checkpoint_interval_seconds,
        );
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            dispatcher.run(stop).await;
        });
    }

    // ── 6. Score service ─────────────────────────────────────────────────
    {
        let service = ScoreService::new(
            state.store.clone(),
            state.assembler.clone(),
            contract.clone(),
            Arc::new(MetricsRegistry::with_builtins()),
            state.merkle.clone(),
            state.events.clone(),
            config.checkpoint_interval_seconds,
        );
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            service.run(stop).await;
        });
    }

    // ── 7. Checkpoint builder ────────────────────────────────────────────
    {
        let service = CheckpointService::new(
            state.store.clone(),
            contract.clone(),
            state.merkle.clone(),
            config.crunch_pubkey.clone(),
            config.compute_provider.clone(),
            config.data_provider.clone(),
            config.checkpoint_period_seconds,
        );
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            service.run(stop).await;
        });
    }

    // ── 8. Read API ──────────────────────────────────────────────────────
    {
        let app = api::router(state.clone());
        let bind_addr = config.bind_addr.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("all workers running — press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping workers");
    let _ = stop_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("coordinator shut down complete");
    Ok(())
}
