// =============================================================================
// Admin API - read-only inspection endpoints
// =============================================================================
//
// Inspection only, by design: there is no endpoint that clears a lockout,
// cancels a timer, or mutates configuration. Lockouts leave through their
// release conditions and nothing else.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::app_state::AppState;
use crate::audit::AuditRecord;
use crate::types::{Lockout, Position};

/// Rows returned by the audit endpoint.
const AUDIT_PAGE_SIZE: u32 = 100;

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    accounts: Vec<String>,
    active_lockouts: usize,
    active_timers: usize,
    open_positions: usize,
}

#[derive(Serialize)]
struct TimerResponse {
    account_id: String,
    tag: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct DailyPnlResponse {
    account_id: String,
    realized_pnl: Decimal,
}

async fn status(State(app): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_secs: app.start_time.elapsed().as_secs(),
        accounts: app.config.accounts.clone(),
        active_lockouts: app.lockouts.all().len(),
        active_timers: app.timers.all().len(),
        open_positions: app.engine_state.all_positions().len(),
    })
}

async fn lockouts(State(app): State<Arc<AppState>>) -> Json<Vec<Lockout>> {
    Json(app.lockouts.all())
}

async fn timers(State(app): State<Arc<AppState>>) -> Json<Vec<TimerResponse>> {
    Json(
        app.timers
            .all()
            .into_iter()
            .map(|(account_id, tag, expires_at)| TimerResponse { account_id, tag, expires_at })
            .collect(),
    )
}

async fn positions(State(app): State<Arc<AppState>>) -> Json<Vec<Position>> {
    Json(app.engine_state.all_positions())
}

async fn audit(
    State(app): State<Arc<AppState>>,
) -> Result<Json<Vec<AuditRecord>>, StatusCode> {
    app.audit
        .recent(AUDIT_PAGE_SIZE)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn daily_pnl(
    State(app): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Result<Json<DailyPnlResponse>, StatusCode> {
    if !app.config.accounts.contains(&account) {
        return Err(StatusCode::NOT_FOUND);
    }
    let realized_pnl = app
        .pnl
        .get_daily(&account, Utc::now())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(DailyPnlResponse { account_id: account, realized_pnl }))
}

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/lockouts", get(lockouts))
        .route("/timers", get(timers))
        .route("/positions", get(positions))
        .route("/audit", get(audit))
        .route("/accounts/:account/daily-pnl", get(daily_pnl))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Serve the admin API until the process exits.
pub async fn serve(app: Arc<AppState>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("admin api bind on port {port}"))?;
    info!(port, "admin api listening");
    axum::serve(listener, router(app)).await.context("admin api server failed")
}
