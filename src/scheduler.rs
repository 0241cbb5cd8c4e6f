//! Round scheduler
//!
//! One task owns the live round. Bets, cash-outs and queries arrive on a
//! bounded mailbox and are handled one at a time, interleaved with the
//! round clock. Before any command or timer is handled the scheduler
//! advances the clock to "now", crashing the round first if the curve has
//! reached the crash point. That gives a single total order between player
//! actions and the crash, so a cash-out can never be accepted at or after
//! the crash instant.
//!
//! ```text
//! Waiting --betting window--> Running --crash point--> Crashed --cooldown--> Settled
//!    ^                                                                          |
//!    +--------------------------------- next round -----------------------------+
//! ```

use crate::{
    config::CrashConfig,
    errors::{CrashError, CrashResult, RoundStateError, SchedulerError, ValidationError},
    fairness::{CrashPointSource, FairDraw},
    ledger::{bounded, BetLedger},
    metrics::GameMetrics,
    multiplier::{Multiplier, MultiplierCurve},
    settlement::{SettlementHandle, SettlementJob},
    store::LedgerStore,
    types::{Bet, BetId, RoundId, RoundPhase, RoundRecord, RoundSnapshot, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

/// Events pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    /// A round entered `Waiting` and accepts bets
    NewRound {
        round_id: RoundId,
        betting_closes_in_ms: u64,
    },
    RoundStarted {
        round_id: RoundId,
        seed_hash: String,
    },
    MultiplierTick {
        round_id: RoundId,
        multiplier: Multiplier,
    },
    BetPlaced {
        round_id: RoundId,
        user_id: UserId,
        bet_id: BetId,
        amount: u64,
    },
    CashedOut {
        round_id: RoundId,
        user_id: UserId,
        bet_id: BetId,
        multiplier: Multiplier,
        win_amount: u64,
    },
    /// `crash_point` is the drawn value that `server_seed` reproduces;
    /// `final_multiplier` is where the round actually stopped, lower only on
    /// a forced crash
    RoundCrashed {
        round_id: RoundId,
        crash_point: Multiplier,
        final_multiplier: Multiplier,
        server_seed: String,
        seed_hash: String,
        forced: bool,
        settled_bets: Vec<Bet>,
    },
    Heartbeat {
        timestamp: i64,
    },
}

/// Result of an accepted cash-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashoutReceipt {
    pub bet: Bet,
    pub multiplier: Multiplier,
    pub win_amount: u64,
}

/// Read-only view of the live round and its bets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRound {
    pub round: RoundSnapshot,
    pub bets: Vec<Bet>,
}

pub enum Command {
    PlaceBet {
        user_id: UserId,
        amount: u64,
        reply: oneshot::Sender<CrashResult<Bet>>,
    },
    CashOut {
        round_id: Option<RoundId>,
        bet_id: BetId,
        user_id: UserId,
        /// Advisory only; rejected when above the server multiplier
        requested: Option<Multiplier>,
        reply: oneshot::Sender<CrashResult<CashoutReceipt>>,
    },
    CurrentRound {
        reply: oneshot::Sender<CurrentRound>,
    },
    /// `None` when the round is no longer live
    RoundBets {
        round_id: RoundId,
        reply: oneshot::Sender<Option<Vec<Bet>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable client side of the scheduler mailbox
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<GameEvent>,
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> CrashResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(make(reply))
            .map_err(|_| SchedulerError::Unavailable)?;
        rx.await.map_err(|_| SchedulerError::ReplyDropped.into())
    }

    pub async fn place_bet(&self, user_id: UserId, amount: u64) -> CrashResult<Bet> {
        self.request(|reply| Command::PlaceBet { user_id, amount, reply })
            .await?
    }

    pub async fn cash_out(
        &self,
        round_id: Option<RoundId>,
        bet_id: BetId,
        user_id: UserId,
        requested: Option<Multiplier>,
    ) -> CrashResult<CashoutReceipt> {
        self.request(|reply| Command::CashOut {
            round_id,
            bet_id,
            user_id,
            requested,
            reply,
        })
        .await?
    }

    pub async fn current_round(&self) -> CrashResult<CurrentRound> {
        self.request(|reply| Command::CurrentRound { reply }).await
    }

    pub async fn round_bets(&self, round_id: RoundId) -> CrashResult<Option<Vec<Bet>>> {
        self.request(|reply| Command::RoundBets { round_id, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    /// Stop the scheduler after the commands already queued
    pub async fn shutdown(&self) -> CrashResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Round {
    id: RoundId,
    phase: RoundPhase,
    betting_closes_at: Instant,
    draw: Option<FairDraw>,
    current_multiplier: Multiplier,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    crashed_at: Option<Instant>,
    forced: bool,
}

impl Round {
    fn waiting(id: RoundId, betting_closes_at: Instant) -> Self {
        Self {
            id,
            phase: RoundPhase::Waiting,
            betting_closes_at,
            draw: None,
            current_multiplier: Multiplier::ONE,
            started_at: None,
            started_wall: None,
            crashed_at: None,
            forced: false,
        }
    }

    fn snapshot(&self) -> RoundSnapshot {
        let revealed = self.phase.is_terminal();
        RoundSnapshot {
            round_id: self.id,
            phase: self.phase,
            current_multiplier: self.current_multiplier,
            started_at: self.started_wall,
            seed_hash: self.draw.as_ref().map(|d| d.seed_hash.clone()),
            crash_point: self.draw.as_ref().filter(|_| revealed).map(|d| d.crash_point),
            server_seed: self.draw.as_ref().filter(|_| revealed).map(|d| d.server_seed_hex()),
        }
    }

    fn inconsistent(&self, what: &str) -> CrashError {
        SchedulerError::InconsistentRound(self.id, what.to_string()).into()
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    betting_window: Duration,
    tick_interval: Duration,
    cooldown: Duration,
}

pub struct RoundScheduler {
    timing: Timing,
    curve: MultiplierCurve,
    source: Box<dyn CrashPointSource>,
    ledger: BetLedger,
    settlement: SettlementHandle,
    metrics: GameMetrics,
    events: broadcast::Sender<GameEvent>,
    mailbox: mpsc::Receiver<Command>,
    round: Round,
    next_tick: Instant,
    retry_at: Option<Instant>,
    /// Callers of `shutdown`, answered once no stake is left in play
    stopping: Vec<oneshot::Sender<()>>,
    #[cfg(test)]
    fault_at: Option<Multiplier>,
}

impl RoundScheduler {
    /// Build a scheduler whose ids continue after the last persisted ones
    pub async fn new(
        config: &CrashConfig,
        source: Box<dyn CrashPointSource>,
        store: Arc<dyn LedgerStore>,
        settlement: SettlementHandle,
        metrics: GameMetrics,
    ) -> CrashResult<(Self, SchedulerHandle)> {
        let (last_round, last_bet) = bounded(config.store_timeout(), store.last_ids()).await?;

        // stakes of a round that never reached its crash, e.g. after a kill
        let stranded: Vec<Bet> = bounded(config.store_timeout(), store.round_bets(last_round))
            .await?
            .into_iter()
            .filter(Bet::is_active)
            .collect();
        if !stranded.is_empty() {
            warn!("Round {} left {} active bet(s) behind", last_round, stranded.len());
        }
        for bet in stranded {
            settlement.flag_unsettled(bet, "round ended before the bet was settled");
        }
        let (tx, mailbox) = mpsc::channel(config.game.mailbox_capacity);
        let (events, _) = broadcast::channel(config.api.event_buffer);

        let timing = Timing {
            betting_window: config.betting_window(),
            tick_interval: config.tick_interval(),
            cooldown: config.cooldown(),
        };
        let now = Instant::now();
        let round = Round::waiting(last_round.next(), now + timing.betting_window);
        let mut ledger = BetLedger::new(store, last_bet, config.store_timeout());
        ledger.open_round(round.id);

        let handle = SchedulerHandle {
            tx,
            events: events.clone(),
        };
        let scheduler = Self {
            timing,
            curve: config.curve(),
            source,
            ledger,
            settlement,
            metrics,
            events,
            mailbox,
            round,
            next_tick: now,
            retry_at: None,
            stopping: Vec::new(),
            #[cfg(test)]
            fault_at: None,
        };
        Ok((scheduler, handle))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("Round scheduler started at round {}", self.round.id);
        self.announce_round(Instant::now());

        let mut mailbox_open = true;
        loop {
            if (!mailbox_open || !self.stopping.is_empty()) && !self.ledger.has_active_bets() {
                break;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = self.mailbox.recv(), if mailbox_open => {
                    self.guarded_advance(Instant::now());
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            info!("All scheduler handles dropped, stopping after round {}", self.round.id);
                            mailbox_open = false;
                            self.ledger.close_betting();
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    self.guarded_advance(Instant::now());
                }
            }
        }

        for reply in self.stopping.drain(..) {
            let _ = reply.send(());
        }
        info!("Round scheduler stopped in round {} ({})", self.round.id, self.round.phase);
    }

    fn next_deadline(&self) -> Instant {
        let now = Instant::now();
        let deadline = match self.round.phase {
            RoundPhase::Waiting => self.round.betting_closes_at,
            RoundPhase::Running => match (self.round.started_at, &self.round.draw) {
                (Some(started), Some(draw)) => {
                    // the curve only reaches the crash point just after the threshold instant
                    let crash_at = started + self.curve.time_to_reach(draw.crash_point) + Duration::from_millis(1);
                    self.next_tick.min(crash_at)
                }
                _ => now,
            },
            RoundPhase::Crashed => self
                .round
                .crashed_at
                .map(|at| at + self.timing.cooldown)
                .unwrap_or(now),
            RoundPhase::Settled => now,
        };
        match self.retry_at {
            Some(retry) => deadline.max(retry),
            None => deadline,
        }
    }

    /// Advance the round clock, containing any fault to the current round
    fn guarded_advance(&mut self, now: Instant) {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.advance(now)));
        let fault = match outcome {
            Ok(Ok(())) => {
                self.retry_at = None;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic),
        };

        error!("Tick fault in round {} ({}): {}", self.round.id, self.round.phase, fault);
        if self.round.phase == RoundPhase::Running {
            let last = self.round.current_multiplier;
            self.crash(last, now, true);
        } else {
            self.retry_at = Some(now + self.timing.tick_interval);
        }
    }

    fn advance(&mut self, now: Instant) -> CrashResult<()> {
        loop {
            match self.round.phase {
                RoundPhase::Waiting => {
                    if now < self.round.betting_closes_at {
                        return Ok(());
                    }
                    self.start_running(now)?;
                }
                RoundPhase::Running => {
                    let started = self.round.started_at.ok_or_else(|| self.round.inconsistent("no start time"))?;
                    let crash_point = self
                        .round
                        .draw
                        .as_ref()
                        .map(|d| d.crash_point)
                        .ok_or_else(|| self.round.inconsistent("no crash point"))?;

                    let multiplier = self.curve.multiplier_at(now.saturating_duration_since(started));
                    self.check_injected_fault(multiplier);

                    if multiplier >= crash_point {
                        self.crash(crash_point, now, false);
                        continue;
                    }
                    if multiplier > self.round.current_multiplier {
                        self.round.current_multiplier = multiplier;
                    }
                    if now >= self.next_tick {
                        self.next_tick = now + self.timing.tick_interval;
                        self.emit(GameEvent::MultiplierTick {
                            round_id: self.round.id,
                            multiplier: self.round.current_multiplier,
                        });
                    }
                    return Ok(());
                }
                RoundPhase::Crashed => {
                    let crashed_at = self.round.crashed_at.ok_or_else(|| self.round.inconsistent("no crash time"))?;
                    if now < crashed_at + self.timing.cooldown {
                        return Ok(());
                    }
                    self.round.phase = RoundPhase::Settled;
                    debug!("Round {} settled", self.round.id);
                }
                RoundPhase::Settled => {
                    self.open_next_round(now);
                    return Ok(());
                }
            }
        }
    }

    #[cfg(test)]
    fn check_injected_fault(&self, multiplier: Multiplier) {
        if self.fault_at.is_some_and(|at| multiplier >= at) {
            panic!("injected tick fault at {}", multiplier);
        }
    }

    #[cfg(not(test))]
    fn check_injected_fault(&self, _multiplier: Multiplier) {}

    /// `Waiting → Running`: the crash point is drawn here and not earlier
    fn start_running(&mut self, now: Instant) -> CrashResult<()> {
        let draw = self.source.draw(self.round.id)?;
        if draw.round_id != self.round.id {
            return Err(self.round.inconsistent("crash point drawn for another round"));
        }

        self.ledger.close_betting();
        let seed_hash = draw.seed_hash.clone();
        self.round.phase = RoundPhase::Running;
        self.round.started_at = Some(now);
        self.round.started_wall = Some(Utc::now());
        self.round.current_multiplier = Multiplier::ONE;
        self.round.draw = Some(draw);
        self.next_tick = now + self.timing.tick_interval;

        info!(
            "Round {} running with {} bet(s), commitment {}",
            self.round.id,
            self.ledger.totals().total_bets,
            seed_hash
        );
        self.emit(GameEvent::RoundStarted {
            round_id: self.round.id,
            seed_hash,
        });
        Ok(())
    }

    /// `Running → Crashed`: remaining bets are lost and archiving is handed off
    fn crash(&mut self, final_multiplier: Multiplier, now: Instant, forced: bool) {
        let round_id = self.round.id;
        self.round.phase = RoundPhase::Crashed;
        self.round.current_multiplier = final_multiplier;
        self.round.crashed_at = Some(now);
        self.round.forced = forced;

        let lost = self.ledger.settle_loss(round_id);
        let totals = self.ledger.totals();

        self.metrics.rounds_total.inc();
        self.metrics.bets_lost_total.inc_by(lost.len() as u64);
        if forced {
            self.metrics.forced_crashes_total.inc();
            warn!("Round {} force-crashed at {}", round_id, final_multiplier);
        } else {
            info!(
                "Round {} crashed at {}: {} bet(s), {} lost, wagered {}, paid {}",
                round_id,
                final_multiplier,
                totals.total_bets,
                lost.len(),
                totals.total_wagered,
                totals.total_payout
            );
        }

        for bet in lost {
            self.settlement.submit(SettlementJob::ArchiveBet(bet));
        }

        let (crash_point, server_seed, seed_hash) = match &self.round.draw {
            Some(draw) => (draw.crash_point, draw.server_seed_hex(), draw.seed_hash.clone()),
            None => (final_multiplier, String::new(), String::new()),
        };
        let record = RoundRecord {
            round_id,
            crash_point,
            final_multiplier,
            server_seed: server_seed.clone(),
            seed_hash: seed_hash.clone(),
            started_at: self.round.started_wall,
            crashed_at: Utc::now(),
            total_bets: totals.total_bets,
            total_wagered: totals.total_wagered,
            total_payout: totals.total_payout,
            forced,
        };
        self.settlement.submit(SettlementJob::ArchiveRound(record));

        self.emit(GameEvent::RoundCrashed {
            round_id,
            crash_point,
            final_multiplier,
            server_seed,
            seed_hash,
            forced,
            settled_bets: self.ledger.bets(),
        });
    }

    fn open_next_round(&mut self, now: Instant) {
        let round_id = self.round.id.next();
        self.round = Round::waiting(round_id, now + self.timing.betting_window);
        self.ledger.open_round(round_id);
        self.announce_round(now);
    }

    fn announce_round(&self, now: Instant) {
        let closes_in = self.round.betting_closes_at.saturating_duration_since(now);
        debug!("Round {} accepting bets for {:?}", self.round.id, closes_in);
        self.emit(GameEvent::NewRound {
            round_id: self.round.id,
            betting_closes_in_ms: closes_in.as_millis() as u64,
        });
    }

    fn emit(&self, event: GameEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::PlaceBet { user_id, amount, reply } => {
                let result = self.place_bet(user_id, amount).await;
                let _ = reply.send(result);
            }
            Command::CashOut {
                round_id,
                bet_id,
                user_id,
                requested,
                reply,
            } => {
                let result = self.cash_out(round_id, bet_id, user_id, requested).await;
                let _ = reply.send(result);
            }
            Command::CurrentRound { reply } => {
                let _ = reply.send(CurrentRound {
                    round: self.round.snapshot(),
                    bets: self.ledger.bets(),
                });
            }
            Command::RoundBets { round_id, reply } => {
                let bets = (round_id == self.round.id).then(|| self.ledger.bets());
                let _ = reply.send(bets);
            }
            Command::Shutdown { reply } => {
                // a live round with stakes in play runs to its crash first
                self.ledger.close_betting();
                if self.ledger.has_active_bets() {
                    info!(
                        "Scheduler shutdown requested, round {} ({}) will crash and settle first",
                        self.round.id, self.round.phase
                    );
                } else {
                    info!("Scheduler shutdown requested");
                }
                self.stopping.push(reply);
            }
        }
    }

    async fn place_bet(&mut self, user_id: UserId, amount: u64) -> CrashResult<Bet> {
        let round_id = self.round.id;
        let result = if self.round.phase == RoundPhase::Waiting {
            self.ledger.place_bet(round_id, user_id, amount).await
        } else {
            Err(RoundStateError::NotAcceptingBets(round_id).into())
        };

        match &result {
            Ok(bet) => {
                self.metrics.bets_placed_total.inc();
                self.metrics.wagered_points_total.inc_by(bet.amount);
                self.emit(GameEvent::BetPlaced {
                    round_id,
                    user_id,
                    bet_id: bet.id,
                    amount,
                });
            }
            Err(e) => self.record_rejection("bet", user_id, e),
        }
        result
    }

    async fn cash_out(
        &mut self,
        round_id: Option<RoundId>,
        bet_id: BetId,
        user_id: UserId,
        requested: Option<Multiplier>,
    ) -> CrashResult<CashoutReceipt> {
        let result = self.try_cash_out(round_id, bet_id, user_id, requested).await;
        match &result {
            Ok(receipt) => {
                self.metrics.cashouts_total.inc();
                self.metrics.paid_points_total.inc_by(receipt.win_amount);
                self.emit(GameEvent::CashedOut {
                    round_id: receipt.bet.round_id,
                    user_id,
                    bet_id,
                    multiplier: receipt.multiplier,
                    win_amount: receipt.win_amount,
                });
            }
            Err(e) => self.record_rejection("cash-out", user_id, e),
        }
        result
    }

    async fn try_cash_out(
        &mut self,
        round_id: Option<RoundId>,
        bet_id: BetId,
        user_id: UserId,
        requested: Option<Multiplier>,
    ) -> CrashResult<CashoutReceipt> {
        let live = self.round.id;
        if let Some(round_id) = round_id {
            if round_id < live {
                return Err(RoundStateError::AlreadyCrashed(round_id).into());
            }
            if round_id > live {
                return Err(RoundStateError::NotRunning(round_id).into());
            }
        }

        match self.round.phase {
            RoundPhase::Running => {}
            RoundPhase::Waiting => return Err(RoundStateError::NotRunning(live).into()),
            RoundPhase::Crashed | RoundPhase::Settled => {
                return Err(RoundStateError::AlreadyCrashed(live).into())
            }
        }

        // the server multiplier is authoritative; the client value only bounds it
        let multiplier = self.round.current_multiplier;
        if let Some(requested) = requested {
            if requested > multiplier {
                return Err(ValidationError::MultiplierAboveServer {
                    requested,
                    current: multiplier,
                }
                .into());
            }
        }

        let bet = self.ledger.settle_cashout(bet_id, user_id, multiplier).await?;
        Ok(CashoutReceipt {
            win_amount: bet.win_amount,
            multiplier,
            bet,
        })
    }

    fn record_rejection(&self, action: &str, user_id: UserId, error: &CrashError) {
        self.metrics.bets_rejected_total.inc();
        if error.is_expected() {
            debug!("Rejected {} from user {} in round {}: {}", action, user_id, self.round.id, error);
        } else {
            warn!("Failed {} from user {} in round {}: {}", action, user_id, self.round.id, error);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic".to_string()
}
