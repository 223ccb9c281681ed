use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ranking_service::api::{self, state::AppState};
use ranking_service::config::{Config, TOP_K_LIMIT};
use ranking_service::consumer::EventConsumer;
use ranking_service::engine::RankingEngine;
use ranking_service::fetch::{HttpBattleClient, HttpPlayerClient};
use ranking_service::index::RedisIndex;
use ranking_service::store::PgRankingStore;

#[derive(Parser)]
#[command(name = "ranking-service")]
#[command(about = "Ranking and leaderboard core for the monster-battle arena")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting ranking-service v{}", env!("CARGO_PKG_VERSION"));
    let config = Config::from_env()?;

    let store = Arc::new(PgRankingStore::connect(&config.database_url()).await?);
    store.ensure_schema().await?;
    let index = Arc::new(RedisIndex::connect(&config.redis_url())?);
    let players = Arc::new(HttpPlayerClient::new(config.player_service_url.clone())?);
    let battles = Arc::new(HttpBattleClient::new(config.battle_service_url.clone())?);

    let engine = Arc::new(RankingEngine::new(
        store,
        index,
        players,
        battles,
        TOP_K_LIMIT,
    ));

    // One-shot reconciliation; tolerant of upstreams that are still down.
    if let Err(err) = engine.bootstrap_from_external_services().await {
        warn!(error = %err, "Bootstrap failed; continuing with existing state");
    }

    let consumer = EventConsumer::connect(&config.broker_url, engine.clone()).await?;
    let consumer_task = tokio::spawn(async move {
        if let Err(err) = consumer.run().await {
            error!(error = %err, "Event consumer stopped");
        }
    });
    let sync_task = tokio::spawn(engine.clone().run_periodic_sync());
    let view_task = tokio::spawn(engine.clone().run_periodic_view_refresh());

    let app = api::build_router(AppState { engine });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.service_port));
    info!("Ranking service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    consumer_task.abort();
    sync_task.abort();
    view_task.abort();
    info!("Ranking service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
