// =============================================================================
// Sentinel - Main Entry Point
// =============================================================================
//
// Startup order matters: state is recovered and the catch-up reset fired
// before the feed opens, so no live event is ever evaluated against stale
// daily totals or missed lockout releases.
// =============================================================================

mod api;
mod app_state;
mod audit;
mod broker;
mod bus;
mod clock;
mod config;
mod dispatcher;
mod engine;
mod engine_state;
mod extremes;
mod frequency;
mod lockout;
mod pnl;
mod rules;
mod store;
mod timers;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::client::GatewayClient;
use crate::bus::EventBus;
use crate::clock::DriftGuard;
use crate::config::RiskConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::store::Store;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // -- 1. Environment & config ------------------------------------------
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("sentinel risk engine starting");

    let config_path = env_or("SENTINEL_CONFIG", "risk_config.json");
    let config = RiskConfig::load(&config_path)?;
    if config.accounts.is_empty() {
        anyhow::bail!("no accounts configured; refusing to start unsupervised");
    }

    // -- 2. Store & shared state ------------------------------------------
    let db_path = env_or("SENTINEL_DB", "sentinel.db");
    let store = Arc::new(Store::open(&db_path)?);
    let app = Arc::new(AppState::new(config, store.clone())?);

    // -- 3. Broker client --------------------------------------------------
    let gateway_url = env_or("GATEWAY_URL", "https://gateway.topstepx.com");
    let gateway_ws_url = env_or("GATEWAY_WS_URL", "wss://gateway.topstepx.com/hubs/user");
    let username = std::env::var("GATEWAY_USERNAME").context("GATEWAY_USERNAME not set")?;
    let api_key = std::env::var("GATEWAY_API_KEY").context("GATEWAY_API_KEY not set")?;
    let client = Arc::new(GatewayClient::new(gateway_url, username, api_key));

    // -- 4. Engine wiring --------------------------------------------------
    let bus = Arc::new(EventBus::new(app.config.queue_capacity));
    let dispatcher = Arc::new(Dispatcher::new(
        client.clone(),
        app.lockouts.clone(),
        app.timers.clone(),
        app.pnl.clone(),
        app.audit.clone(),
        app.config.clone(),
    ));
    let engine = Arc::new(Engine::new(app.clone(), dispatcher, bus.clone()));

    // Workers first: queues must exist before anything publishes.
    let _workers = engine.spawn_account_workers();
    info!(accounts = app.config.accounts.len(), "account workers running");

    // -- 5. Recovery before the feed opens ---------------------------------
    let recovery_events = app.recover()?;
    for (account, event) in recovery_events {
        bus.publish(&account, event).await;
    }
    clock::catch_up_reset(&app.scheduler, &store, &bus).await?;

    // -- 6. Background tasks ----------------------------------------------
    let drift = Arc::new(DriftGuard::new());
    tokio::spawn(clock::run_reset_scheduler(
        app.scheduler,
        store.clone(),
        bus.clone(),
        drift.clone(),
    ));
    tokio::spawn(clock::run_tick_task(
        bus.clone(),
        drift.clone(),
        app.config.tick_interval_secs,
    ));
    tokio::spawn(broker::feed::run_feed(
        gateway_ws_url,
        client.clone(),
        bus.clone(),
        app.audit.clone(),
    ));

    let admin_port: u16 = env_or("SENTINEL_ADMIN_PORT", "8090")
        .parse()
        .context("SENTINEL_ADMIN_PORT must be a port number")?;
    let api_app = app.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_app, admin_port).await {
            error!(error = %e, "admin api stopped");
        }
    });

    info!("sentinel online; supervising {:?}", app.config.accounts);

    // -- 7. Run until interrupted ------------------------------------------
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; exiting");
    Ok(())
}
