use crate::multiplier::Multiplier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically assigned round identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoundId(pub u64);

/// Monotonically assigned bet identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BetId(pub u64);

/// Platform user identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl RoundId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl BetId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round lifecycle: `Waiting → Running → Crashed → Settled`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Waiting,
    Running,
    Crashed,
    Settled,
}

impl RoundPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundPhase::Crashed | RoundPhase::Settled)
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundPhase::Waiting => write!(f, "waiting"),
            RoundPhase::Running => write!(f, "running"),
            RoundPhase::Crashed => write!(f, "crashed"),
            RoundPhase::Settled => write!(f, "settled"),
        }
    }
}

/// Bet lifecycle: `Active → CashedOut | Lost`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Active,
    CashedOut,
    Lost,
}

/// One player's stake in exactly one round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bet {
    pub id: BetId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub amount: u64,
    pub status: BetStatus,
    /// Multiplier accepted by the scheduler, set only on cash out
    pub cashout_multiplier: Option<Multiplier>,
    pub win_amount: u64,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Bet {
    pub fn new(id: BetId, round_id: RoundId, user_id: UserId, amount: u64) -> Self {
        Self {
            id,
            round_id,
            user_id,
            amount,
            status: BetStatus::Active,
            cashout_multiplier: None,
            win_amount: 0,
            placed_at: Utc::now(),
            settled_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BetStatus::Active
    }

    /// Terminal copy of this bet locked in at `multiplier`
    pub fn cashed_out(&self, multiplier: Multiplier) -> Self {
        Self {
            status: BetStatus::CashedOut,
            cashout_multiplier: Some(multiplier),
            win_amount: multiplier.payout(self.amount),
            settled_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    /// Terminal copy of this bet after the round crashed
    pub fn lost(&self) -> Self {
        Self {
            status: BetStatus::Lost,
            cashout_multiplier: None,
            win_amount: 0,
            settled_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}

/// Archived summary of a finished round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundRecord {
    pub round_id: RoundId,
    /// Crash point drawn by the generator; verifiable from `server_seed`
    pub crash_point: Multiplier,
    /// Multiplier the round actually ended at; differs only on forced crashes
    pub final_multiplier: Multiplier,
    pub server_seed: String,
    pub seed_hash: String,
    pub started_at: Option<DateTime<Utc>>,
    pub crashed_at: DateTime<Utc>,
    pub total_bets: u32,
    pub total_wagered: u64,
    pub total_payout: u64,
    pub forced: bool,
}

/// Kind of a points-history row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    CrashBet,
    CrashWin,
}

/// Append-only audit row paired with every balance mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub user_id: UserId,
    pub delta: i64,
    pub reason: String,
    pub kind: HistoryKind,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn bet_placed(bet: &Bet) -> Self {
        Self {
            user_id: bet.user_id,
            delta: -(bet.amount.min(i64::MAX as u64) as i64),
            reason: format!("crash bet round {}", bet.round_id),
            kind: HistoryKind::CrashBet,
            created_at: Utc::now(),
        }
    }

    pub fn cashed_out(bet: &Bet, multiplier: Multiplier) -> Self {
        Self {
            user_id: bet.user_id,
            delta: bet.win_amount.min(i64::MAX as u64) as i64,
            reason: format!("crash cashout round {} at {}", bet.round_id, multiplier),
            kind: HistoryKind::CrashWin,
            created_at: Utc::now(),
        }
    }
}

/// Client-facing view of a round. The crash point is only present once the
/// round has crashed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub phase: RoundPhase,
    pub current_multiplier: Multiplier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_point: Option<Multiplier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
}

/// Aggregate statistics for one player
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStats {
    pub total_games: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_wagered: u64,
    pub total_won: u64,
    pub best_multiplier: Option<Multiplier>,
}

impl PlayerStats {
    pub fn from_bets<'a>(bets: impl IntoIterator<Item = &'a Bet>) -> Self {
        let mut stats = Self::default();
        for bet in bets {
            stats.total_games += 1;
            stats.total_wagered = stats.total_wagered.saturating_add(bet.amount);
            match bet.status {
                BetStatus::CashedOut => {
                    stats.wins += 1;
                    stats.total_won = stats.total_won.saturating_add(bet.win_amount);
                    stats.best_multiplier = stats.best_multiplier.max(bet.cashout_multiplier);
                }
                BetStatus::Lost => stats.losses += 1,
                BetStatus::Active => {}
            }
        }
        stats
    }
}
