//! Error types for the crash table
//!
//! The root [`CrashError`] mirrors the taxonomy the gateway reports to callers:
//! validation and round-state rejections are expected under normal play, while
//! storage and scheduler failures are faults.

use crate::fairness::FairnessError;
use crate::multiplier::Multiplier;
use crate::types::{BetId, RoundId, UserId};
use std::fmt;

/// Root error type for all crash table operations
#[derive(Debug, Clone, PartialEq)]
pub enum CrashError {
    /// Configuration loading or validation errors
    Configuration(ConfigurationError),

    /// Malformed requests (bad amount, bet not found, wrong owner)
    Validation(ValidationError),

    /// Balance too low for the requested stake
    InsufficientBalance {
        user_id: UserId,
        balance: u64,
        required: u64,
    },

    /// Bet lifecycle violations
    Bet(BetError),

    /// Request arrived in the wrong round phase
    RoundState(RoundStateError),

    /// Crash point generation failures
    Fairness(FairnessError),

    /// Balance store or archive failures
    Storage(StorageError),

    /// The scheduler task could not be reached
    Scheduler(SchedulerError),

    /// Metrics registry errors
    Monitoring(String),
}

/// Request shape errors, rejected synchronously and never retried
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    InvalidAmount { amount: u64, min: u64, max: u64 },
    InvalidLimit { limit: usize, max: usize },
    MultiplierAboveServer { requested: Multiplier, current: Multiplier },
    InvalidSeed(String),
}

/// Bet lifecycle errors raised by the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum BetError {
    DuplicateBet { round_id: RoundId, user_id: UserId },
    BetNotFound(BetId),
    BetNotActive(BetId),
    NotOwner { bet_id: BetId, user_id: UserId },
}

/// Phase errors: expected races between players and the round clock
#[derive(Debug, Clone, PartialEq)]
pub enum RoundStateError {
    NotAcceptingBets(RoundId),
    NotRunning(RoundId),
    AlreadyCrashed(RoundId),
}

/// Configuration and validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Balance store and archive errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("Insufficient balance for user {user_id}: has {balance}, needs {required}")]
    InsufficientBalance {
        user_id: UserId,
        balance: u64,
        required: u64,
    },

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Store call timed out after {0}ms")]
    Timeout(u64),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Scheduler mailbox errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler unavailable")]
    Unavailable,

    #[error("Scheduler dropped the reply")]
    ReplyDropped,

    #[error("Round {0} is in an inconsistent state: {1}")]
    InconsistentRound(RoundId, String),
}

impl CrashError {
    /// Whether this error is an expected outcome of normal play.
    ///
    /// Expected errors are logged at `debug`; everything else is a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            CrashError::Validation(_)
                | CrashError::InsufficientBalance { .. }
                | CrashError::Bet(_)
                | CrashError::RoundState(_)
        )
    }

    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            CrashError::Configuration(_) => "CONFIGURATION_ERROR",
            CrashError::Validation(ValidationError::InvalidAmount { .. }) => "INVALID_AMOUNT",
            CrashError::Validation(ValidationError::InvalidLimit { .. }) => "INVALID_LIMIT",
            CrashError::Validation(ValidationError::MultiplierAboveServer { .. }) => "INVALID_MULTIPLIER",
            CrashError::Validation(ValidationError::InvalidSeed(_)) => "INVALID_SEED",
            CrashError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CrashError::Bet(BetError::DuplicateBet { .. }) => "DUPLICATE_BET",
            CrashError::Bet(BetError::BetNotFound(_)) => "BET_NOT_FOUND",
            CrashError::Bet(BetError::BetNotActive(_)) => "BET_NOT_ACTIVE",
            CrashError::Bet(BetError::NotOwner { .. }) => "NOT_OWNER",
            CrashError::RoundState(RoundStateError::NotAcceptingBets(_)) => "ROUND_NOT_ACCEPTING_BETS",
            CrashError::RoundState(RoundStateError::NotRunning(_)) => "ROUND_NOT_RUNNING",
            CrashError::RoundState(RoundStateError::AlreadyCrashed(_)) => "ROUND_ALREADY_CRASHED",
            CrashError::Fairness(_) => "FAIRNESS_ERROR",
            CrashError::Storage(_) => "SETTLEMENT_PERSISTENCE_ERROR",
            CrashError::Scheduler(_) => "SCHEDULER_UNAVAILABLE",
            CrashError::Monitoring(_) => "MONITORING_ERROR",
        }
    }
}

impl fmt::Display for CrashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashError::Configuration(e) => write!(f, "Configuration error: {}", e),
            CrashError::Validation(e) => write!(f, "Validation error: {}", e),
            CrashError::InsufficientBalance { user_id, balance, required } => write!(
                f,
                "Insufficient balance: user {} has {}, needs {}",
                user_id, balance, required
            ),
            CrashError::Bet(e) => write!(f, "Bet error: {}", e),
            CrashError::RoundState(e) => write!(f, "Round state error: {}", e),
            CrashError::Fairness(e) => write!(f, "Fairness error: {}", e),
            CrashError::Storage(e) => write!(f, "Storage error: {}", e),
            CrashError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
            CrashError::Monitoring(msg) => write!(f, "Monitoring error: {}", msg),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidAmount { amount, min, max } => {
                write!(f, "Bet amount {} outside allowed range {}..={}", amount, min, max)
            }
            ValidationError::InvalidLimit { limit, max } => {
                write!(f, "Limit {} outside allowed range 1..={}", limit, max)
            }
            ValidationError::MultiplierAboveServer { requested, current } => write!(
                f,
                "Requested multiplier {} exceeds server multiplier {}",
                requested, current
            ),
            ValidationError::InvalidSeed(msg) => write!(f, "Invalid seed: {}", msg),
        }
    }
}

impl fmt::Display for BetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetError::DuplicateBet { round_id, user_id } => {
                write!(f, "User {} already has a bet in round {}", user_id, round_id)
            }
            BetError::BetNotFound(id) => write!(f, "Bet {} not found", id),
            BetError::BetNotActive(id) => write!(f, "Bet {} is not active", id),
            BetError::NotOwner { bet_id, user_id } => {
                write!(f, "Bet {} does not belong to user {}", bet_id, user_id)
            }
        }
    }
}

impl fmt::Display for RoundStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundStateError::NotAcceptingBets(id) => write!(f, "Round {} is not accepting bets", id),
            RoundStateError::NotRunning(id) => write!(f, "Round {} is not running", id),
            RoundStateError::AlreadyCrashed(id) => write!(f, "Round {} already crashed", id),
        }
    }
}

impl std::error::Error for CrashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrashError::Configuration(e) => Some(e),
            CrashError::Validation(e) => Some(e),
            CrashError::Bet(e) => Some(e),
            CrashError::RoundState(e) => Some(e),
            CrashError::Fairness(e) => Some(e),
            CrashError::Storage(e) => Some(e),
            CrashError::Scheduler(e) => Some(e),
            CrashError::InsufficientBalance { .. } | CrashError::Monitoring(_) => None,
        }
    }
}

impl std::error::Error for ValidationError {}
impl std::error::Error for BetError {}
impl std::error::Error for RoundStateError {}

impl From<ConfigurationError> for CrashError {
    fn from(e: ConfigurationError) -> Self {
        CrashError::Configuration(e)
    }
}

impl From<ValidationError> for CrashError {
    fn from(e: ValidationError) -> Self {
        CrashError::Validation(e)
    }
}

impl From<BetError> for CrashError {
    fn from(e: BetError) -> Self {
        CrashError::Bet(e)
    }
}

impl From<RoundStateError> for CrashError {
    fn from(e: RoundStateError) -> Self {
        CrashError::RoundState(e)
    }
}

// A bad seed is the caller's mistake; everything else is a fault
impl From<FairnessError> for CrashError {
    fn from(e: FairnessError) -> Self {
        match e {
            FairnessError::InvalidSeed(msg) => CrashError::Validation(ValidationError::InvalidSeed(msg)),
            other => CrashError::Fairness(other),
        }
    }
}

impl From<SchedulerError> for CrashError {
    fn from(e: SchedulerError) -> Self {
        CrashError::Scheduler(e)
    }
}

// Insufficient balance is surfaced verbatim rather than as a storage fault
impl From<StorageError> for CrashError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InsufficientBalance { user_id, balance, required } => {
                CrashError::InsufficientBalance { user_id, balance, required }
            }
            other => CrashError::Storage(other),
        }
    }
}

impl From<prometheus::Error> for CrashError {
    fn from(e: prometheus::Error) -> Self {
        CrashError::Monitoring(e.to_string())
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::WriteFailed(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

impl From<std::io::Error> for CrashError {
    fn from(e: std::io::Error) -> Self {
        CrashError::Storage(StorageError::ReadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type CrashResult<T> = Result<T, CrashError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let error = CrashError::Bet(BetError::BetNotActive(BetId(7)));
        assert!(error.to_string().contains("Bet error"));
        assert!(error.to_string().contains("7"));
    }

    #[test]
    fn test_insufficient_balance_is_surfaced_verbatim() {
        let storage = StorageError::InsufficientBalance {
            user_id: UserId(3),
            balance: 5,
            required: 50,
        };
        let error: CrashError = storage.into();

        assert_eq!(error.code(), "INSUFFICIENT_BALANCE");
        assert!(error.is_expected());
    }

    #[test]
    fn test_round_state_errors_are_expected() {
        let error: CrashError = RoundStateError::AlreadyCrashed(RoundId(1)).into();
        assert!(error.is_expected());
        assert_eq!(error.code(), "ROUND_ALREADY_CRASHED");

        let fault: CrashError = StorageError::Timeout(2000).into();
        assert!(!fault.is_expected());
    }

    #[test]
    fn test_error_source() {
        let error: CrashError = ConfigurationError::ValidationFailed("test".to_string()).into();
        assert!(error.source().is_some());
    }
}
