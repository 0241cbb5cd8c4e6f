//! Route Definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::{handlers::*, websocket::websocket_handler};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Game actions (require x-user-id)
        .route("/crash/bet", post(place_bet_handler))
        .route("/crash/cashout", post(cashout_handler))
        // Round queries
        .route("/crash/current", get(current_round_handler))
        .route("/crash/history", get(history_handler))
        .route("/crash/rounds/:id/bets", get(round_bets_handler))
        .route("/crash/verify", get(verify_handler))
        // Player queries (require x-user-id)
        .route("/crash/stats", get(stats_handler))
        .route("/crash/balance", get(balance_handler))
        .route("/crash/points-history", get(points_history_handler))
        // Operations
        .route("/reconciliation", get(reconciliation_handler))
        .route("/metrics", get(metrics_handler))
        // Real-time push channel
        .route("/ws", get(websocket_handler))
        .with_state(state)
}
