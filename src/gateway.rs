//! Game gateway
//!
//! Boundary between callers and the round scheduler. Request shape is
//! validated here before anything reaches the scheduler mailbox; queries for
//! finished rounds go straight to the store. Scheduler events are forwarded
//! to an [`EventPublisher`] such as the WebSocket manager.

use crate::{
    config::CrashConfig,
    errors::{CrashResult, ValidationError},
    fairness::{CrashPointGenerator, Verification},
    ledger::bounded,
    multiplier::Multiplier,
    scheduler::{CashoutReceipt, CurrentRound, GameEvent, SchedulerHandle},
    settlement::{ReconciliationEntry, ReconciliationQueue},
    store::LedgerStore,
    types::{Bet, BetId, HistoryEntry, PlayerStats, RoundId, RoundRecord, UserId},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

/// External notification transport for round events
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: GameEvent);
}

/// Request limits enforced before the scheduler sees a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayLimits {
    pub min_bet: u64,
    pub max_bet: u64,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl GatewayLimits {
    pub fn from_config(config: &CrashConfig) -> Self {
        Self {
            min_bet: config.game.min_bet,
            max_bet: config.game.max_bet,
            default_limit: config.game.history_default_limit,
            max_limit: config.game.history_max_limit,
        }
    }

    pub fn check_amount(&self, amount: u64) -> Result<u64, ValidationError> {
        if amount < self.min_bet || amount > self.max_bet {
            return Err(ValidationError::InvalidAmount {
                amount,
                min: self.min_bet,
                max: self.max_bet,
            });
        }
        Ok(amount)
    }

    /// `None` means the default page size
    pub fn check_limit(&self, limit: Option<usize>) -> Result<usize, ValidationError> {
        let limit = limit.unwrap_or(self.default_limit);
        if limit == 0 || limit > self.max_limit {
            return Err(ValidationError::InvalidLimit {
                limit,
                max: self.max_limit,
            });
        }
        Ok(limit)
    }
}

#[derive(Clone)]
pub struct GameGateway {
    scheduler: SchedulerHandle,
    store: Arc<dyn LedgerStore>,
    reconciliation: Arc<ReconciliationQueue>,
    verifier: CrashPointGenerator,
    limits: GatewayLimits,
    store_timeout: Duration,
}

impl GameGateway {
    pub fn new(
        config: &CrashConfig,
        scheduler: SchedulerHandle,
        store: Arc<dyn LedgerStore>,
        reconciliation: Arc<ReconciliationQueue>,
    ) -> Self {
        Self {
            scheduler,
            store,
            reconciliation,
            verifier: CrashPointGenerator::new(config.fairness_params()),
            limits: GatewayLimits::from_config(config),
            store_timeout: config.store_timeout(),
        }
    }

    pub fn limits(&self) -> GatewayLimits {
        self.limits
    }

    pub async fn place_bet(&self, user_id: UserId, amount: u64) -> CrashResult<Bet> {
        let amount = self.limits.check_amount(amount)?;
        self.scheduler.place_bet(user_id, amount).await
    }

    /// `requested` is the multiplier the client saw; it only bounds the
    /// accepted value from above
    pub async fn cash_out(
        &self,
        user_id: UserId,
        bet_id: BetId,
        round_id: Option<RoundId>,
        requested: Option<Multiplier>,
    ) -> CrashResult<CashoutReceipt> {
        self.scheduler.cash_out(round_id, bet_id, user_id, requested).await
    }

    pub async fn current_round(&self) -> CrashResult<CurrentRound> {
        self.scheduler.current_round().await
    }

    /// Bets of any round; the live round is answered by the scheduler
    pub async fn round_bets(&self, round_id: RoundId) -> CrashResult<Vec<Bet>> {
        if let Some(bets) = self.scheduler.round_bets(round_id).await? {
            return Ok(bets);
        }
        let mut bets = bounded(self.store_timeout, self.store.round_bets(round_id)).await?;
        bets.sort_by_key(|bet| bet.id);
        Ok(bets)
    }

    /// Finished rounds, newest first
    pub async fn history(&self, limit: Option<usize>) -> CrashResult<Vec<RoundRecord>> {
        let limit = self.limits.check_limit(limit)?;
        Ok(bounded(self.store_timeout, self.store.recent_rounds(limit)).await?)
    }

    pub async fn user_stats(&self, user_id: UserId) -> CrashResult<PlayerStats> {
        let bets = bounded(self.store_timeout, self.store.user_bets(user_id)).await?;
        Ok(PlayerStats::from_bets(&bets))
    }

    pub async fn balance(&self, user_id: UserId) -> CrashResult<u64> {
        let balance = bounded(self.store_timeout, self.store.balance(user_id)).await?;
        Ok(balance.unwrap_or(0))
    }

    /// Points history rows of a user, newest first
    pub async fn points_history(&self, user_id: UserId, limit: Option<usize>) -> CrashResult<Vec<HistoryEntry>> {
        let limit = self.limits.check_limit(limit)?;
        Ok(bounded(self.store_timeout, self.store.history(user_id, limit)).await?)
    }

    /// Recompute the crash point of a round from its revealed seed
    pub fn verify(&self, round_id: RoundId, server_seed: &str) -> CrashResult<Verification> {
        Ok(self.verifier.verify(server_seed, round_id)?)
    }

    pub fn reconciliation(&self) -> Vec<ReconciliationEntry> {
        self.reconciliation.entries()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.scheduler.subscribe()
    }

    /// Forward every scheduler event to `publisher` until the scheduler stops
    pub fn forward_events(&self, publisher: Arc<dyn EventPublisher>) -> JoinHandle<()> {
        let mut events = self.scheduler.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => publisher.publish(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // consumers already tolerate missing ticks
                        warn!("Event forwarder lagged, skipped {} event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Scheduler event stream closed");
                        break;
                    }
                }
            }
            debug!("Event forwarder stopped");
        })
    }
}
