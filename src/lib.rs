//! Crash Table - real-time crash wagering game
//!
//! A single scheduler task owns the live round. Bets and cash-outs are
//! funneled through its mailbox, so every player action is totally ordered
//! against the crash. Balances move through the bet ledger in atomic store
//! batches; archiving after a crash is handed to a settlement worker that
//! retries failures and flags what it cannot persist.

pub mod api;
pub mod config;
pub mod errors;
pub mod factory;
pub mod fairness;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod multiplier;
pub mod scheduler;
pub mod settlement;
pub mod storage;
pub mod store;
pub mod types;

pub use errors::{CrashError, CrashResult};
pub use factory::{CrashTable, GameFactory};
pub use gateway::GameGateway;
pub use multiplier::{Multiplier, MultiplierCurve};
pub use scheduler::{GameEvent, RoundScheduler, SchedulerHandle};
