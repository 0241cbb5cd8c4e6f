//! Request Handlers
//!
//! Thin adapters from HTTP to the game gateway. Every handler tags its errors
//! with the request id assigned by the middleware.

use super::{
    errors::ApiError,
    middleware::{Caller, RequestId},
    models::*,
    websocket::WebSocketManager,
};
use crate::{
    gateway::GameGateway,
    metrics::GameMetrics,
    multiplier::Multiplier,
    scheduler::CurrentRound,
    types::{Bet, RoundId},
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub gateway: GameGateway,
    pub websocket_manager: Arc<WebSocketManager>,
    pub metrics: GameMetrics,
    pub metrics_enabled: bool,
    pub version: String,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// POST /crash/bet
pub async fn place_bet_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    body: Result<Json<PlaceBetRequest>, JsonRejection>,
) -> Result<Json<Bet>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::invalid_body(request_id.0.clone(), e))?;
    state
        .gateway
        .place_bet(user_id, body.amount)
        .await
        .map(Json)
        .map_err(|e| ApiError::game(request_id.0, e))
}

/// POST /crash/cashout
pub async fn cashout_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    body: Result<Json<CashoutRequest>, JsonRejection>,
) -> Result<Json<CashoutResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::invalid_body(request_id.0.clone(), e))?;
    let requested = match body.multiplier {
        Some(value) => Some(Multiplier::from_f64_rounded(value).ok_or_else(|| {
            ApiError::bad_request(request_id.0.clone(), format!("invalid multiplier {}", value))
        })?),
        None => None,
    };

    let receipt = state
        .gateway
        .cash_out(user_id, body.bet_id, body.round_id, requested)
        .await
        .map_err(|e| ApiError::game(request_id.0, e))?;

    Ok(Json(CashoutResponse {
        bet: receipt.bet,
        multiplier: receipt.multiplier,
        win_amount: receipt.win_amount,
    }))
}

/// GET /crash/current
pub async fn current_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<CurrentRound>, ApiError> {
    state
        .gateway
        .current_round()
        .await
        .map(Json)
        .map_err(|e| ApiError::game(request_id.0, e))
}

/// GET /crash/history?limit={n}
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let rounds = state
        .gateway
        .history(query.limit)
        .await
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(Json(HistoryResponse { rounds }))
}

/// GET /crash/rounds/:id/bets
pub async fn round_bets_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<u64>,
) -> Result<Json<RoundBetsResponse>, ApiError> {
    let round_id = RoundId(round_id);
    let bets = state
        .gateway
        .round_bets(round_id)
        .await
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(Json(RoundBetsResponse { round_id, bets }))
}

/// GET /crash/stats
pub async fn stats_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .gateway
        .user_stats(user_id)
        .await
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(Json(StatsResponse { user_id, stats }))
}

/// GET /crash/balance
pub async fn balance_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state
        .gateway
        .balance(user_id)
        .await
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

/// GET /crash/points-history?limit={n}
pub async fn points_history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Query(query): Query<LimitQuery>,
) -> Result<Json<PointsHistoryResponse>, ApiError> {
    let entries = state
        .gateway
        .points_history(user_id, query.limit)
        .await
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(Json(PointsHistoryResponse { user_id, entries }))
}

/// GET /crash/verify?round_id={id}&seed={hex}
pub async fn verify_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let verification = state
        .gateway
        .verify(query.round_id, &query.seed)
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(Json(VerifyResponse { verification }))
}

/// GET /reconciliation
pub async fn reconciliation_handler(State(state): State<Arc<AppState>>) -> Json<ReconciliationResponse> {
    let entries = state.gateway.reconciliation();
    Json(ReconciliationResponse {
        pending: entries.len(),
        entries,
    })
}

/// GET /metrics
pub async fn metrics_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    if !state.metrics_enabled {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    state.metrics.websocket_clients.set(state.websocket_manager.client_count() as i64);
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::game(request_id.0, e))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}
