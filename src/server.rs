//! Public Verification Server
//!
//! Read-only HTTP surface: health, anonymous global stats, the leaderboard
//! and certificate / physical reward verification. Everything served here is
//! already anonymous; no endpoint accepts or returns a raw identity.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};

use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::redact::redact;
use crate::store::PgStore;

const DEFAULT_LEADERBOARD_LIMIT: i64 = 10;
const MAX_LEADERBOARD_LIMIT: i64 = 100;

pub struct AppState {
    pub store: Arc<PgStore>,
    pub started_at: std::time::Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/leaderboard", get(leaderboard_handler))
        .route("/verify/certificate/:certificate_id", get(verify_certificate_handler))
        .route("/verify/reward/:serial", get(verify_reward_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub database: String,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (healthy, database) = match state.store.health_check().await {
        Ok(()) => (true, "ok".to_string()),
        Err(e) => {
            error!("Health check failed: {}", redact(&e.to_string()));
            (false, "unavailable".to_string())
        }
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            database,
            uptime_secs: state.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.store.get_aggregate_statistics().await {
        Ok(stats) => Json(serde_json::json!({ "stats": stats })),
        Err(e) => {
            error!("Stats query failed: {}", redact(&e.to_string()));
            Json(serde_json::json!({ "error": "stats unavailable" }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
}

async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> Json<serde_json::Value> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .clamp(1, MAX_LEADERBOARD_LIMIT);

    match state.store.get_leaderboard(limit).await {
        Ok(rows) => Json(serde_json::json!({ "leaderboard": rows })),
        Err(e) => {
            error!("Leaderboard query failed: {}", redact(&e.to_string()));
            Json(serde_json::json!({ "error": "leaderboard unavailable" }))
        }
    }
}

// ============================================================================
// GET /verify/* - Public authenticity checks
// ============================================================================

async fn verify_certificate_handler(
    State(state): State<Arc<AppState>>,
    Path(certificate_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.verify_certificate(&certificate_id).await {
        Ok(Some(cert)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "valid": true, "certificate": cert })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "valid": false, "error": "certificate not found" })),
        ),
        Err(e) => {
            error!("Certificate lookup failed: {}", redact(&e.to_string()));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "valid": false, "error": "verification unavailable" })),
            )
        }
    }
}

async fn verify_reward_handler(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.lookup_reward_by_serial(&serial).await {
        Ok(Some(reward)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "valid": true, "reward": reward })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "valid": false, "error": "serial not found" })),
        ),
        Err(e) => {
            error!("Reward lookup failed: {}", redact(&e.to_string()));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "valid": false, "error": "verification unavailable" })),
            )
        }
    }
}

/// Run the server
pub async fn run_server(host: &str, port: u16, store: Arc<PgStore>) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        store,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    tracing::info!("Starting verification server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
