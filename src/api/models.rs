//! API Request and Response Models

use crate::{
    fairness::Verification,
    multiplier::Multiplier,
    settlement::ReconciliationEntry,
    types::{Bet, BetId, HistoryEntry, PlayerStats, RoundId, RoundRecord, UserId},
};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// POST /crash/bet
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceBetRequest {
    pub amount: u64,
}

/// POST /crash/cashout
#[derive(Debug, Clone, Deserialize)]
pub struct CashoutRequest {
    pub bet_id: BetId,
    #[serde(default)]
    pub round_id: Option<RoundId>,
    /// Multiplier the client displayed; never above the server's
    #[serde(default)]
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashoutResponse {
    pub bet: Bet,
    pub multiplier: Multiplier,
    pub win_amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub rounds: Vec<RoundRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundBetsResponse {
    pub round_id: RoundId,
    pub bets: Vec<Bet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub user_id: UserId,
    #[serde(flatten)]
    pub stats: PlayerStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsHistoryResponse {
    pub user_id: UserId,
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    #[serde(flatten)]
    pub verification: Verification,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResponse {
    pub pending: usize,
    pub entries: Vec<ReconciliationEntry>,
}

/// `?limit=N`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `?round_id=N&seed=HEX`
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyQuery {
    pub round_id: RoundId,
    pub seed: String,
}
