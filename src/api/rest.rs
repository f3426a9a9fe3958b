// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The admin surface for the dashboard and the testnet execution session.
// Errors follow one convention: `{"error": string}` with an HTTP 4xx/5xx
// status.  CORS honours ALLOWED_ORIGINS from the environment; an empty list
// means permissive (development).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::execution::engine::ExecutionResult;
use crate::execution::ExecutionSettings;
use crate::types::Side;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state.config.allowed_origins);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/api/health", get(health))
        // ── Testnet passthrough ─────────────────────────────────────
        .route("/api/testnet/exchange-info", get(exchange_info))
        // ── Execution session ───────────────────────────────────────
        .route("/api/execution/status", get(execution_status))
        .route("/api/execution/connect", post(execution_connect))
        .route("/api/execution/disconnect", post(execution_disconnect))
        .route("/api/execution/enabled", post(execution_enabled))
        .route("/api/execution/settings", post(execution_settings))
        .route("/api/execution/symbol", post(execution_symbol))
        .route("/api/execution/order", post(execution_order))
        // ── Subscriber WebSocket ────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<axum::http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Shared `{error}` body for all failure responses.
fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_snapshot())
}

// =============================================================================
// Testnet passthrough
// =============================================================================

async fn exchange_info(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.execution.exchange_info().await {
        Ok(info) => Ok(Json(info)),
        Err(e) => {
            warn!(error = %e, "exchange-info fetch failed");
            Err(api_error(StatusCode::BAD_GATEWAY, format!("{e:#}")))
        }
    }
}

// =============================================================================
// Execution session
// =============================================================================

async fn execution_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.execution.status().await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    api_key: String,
    api_secret: String,
}

async fn execution_connect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.execution.connect(req.api_key, req.api_secret).await {
        Ok(()) => {
            state.events.push("execution session connected");
            Ok(Json(state.execution.status().await))
        }
        Err(e) => {
            warn!(error = %e, "execution connect failed");
            state
                .events
                .push_with_code(format!("execution connect failed: {e:#}"), None);
            Err(api_error(StatusCode::BAD_REQUEST, format!("{e:#}")))
        }
    }
}

async fn execution_disconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.execution.disconnect().await;
    state.events.push("execution session disconnected");
    Json(state.execution.status().await)
}

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn execution_enabled(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnabledRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.execution.set_enabled(req.enabled).await {
        Ok(()) => {
            info!(enabled = req.enabled, "execution enabled flag changed via API");
            Ok(Json(state.execution.status().await))
        }
        Err(e) => Err(api_error(StatusCode::CONFLICT, format!("{e:#}"))),
    }
}

async fn execution_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<ExecutionSettings>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.execution.apply_settings(settings).await {
        Ok(()) => Ok(Json(state.execution.status().await)),
        Err(e) => Err(api_error(StatusCode::BAD_REQUEST, format!("{e:#}"))),
    }
}

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

async fn execution_symbol(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.execution.set_symbol(req.symbol).await {
        Ok(()) => Ok(Json(state.execution.status().await)),
        Err(e) => Err(api_error(StatusCode::BAD_REQUEST, format!("{e:#}"))),
    }
}

#[derive(Deserialize)]
struct OrderRequest {
    side: Side,
}

/// Manual order placement for the testnet session. The mark price comes from
/// the symbol's live pipeline; sizing is entirely ramp-driven.
async fn execution_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrderRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let symbol = state.execution.status().await.symbol;
    let mark_price = match state.pipeline(&symbol) {
        Some(pipeline) => {
            let mid = pipeline.book.read().book().mid_price();
            if mid > 0.0 {
                mid
            } else {
                pipeline.legacy.read().last_price()
            }
        }
        None => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("no market data pipeline for {symbol}"),
            ))
        }
    };

    if mark_price <= 0.0 {
        return Err(api_error(
            StatusCode::CONFLICT,
            "no mark price available yet",
        ));
    }

    match state.execution.place_order(req.side, mark_price).await {
        ExecutionResult::Placed(response) => Ok(Json(response)),
        ExecutionResult::Blocked(reason) => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("order blocked: {reason}"),
        )),
        ExecutionResult::Rejected(reason) => Err(api_error(StatusCode::CONFLICT, reason)),
        ExecutionResult::Error(err) => {
            state.events.push_with_code(err.clone(), None);
            Err(api_error(StatusCode::BAD_GATEWAY, err))
        }
    }
}
