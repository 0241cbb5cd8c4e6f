//! Settlement worker
//!
//! Archiving after a crash runs off the scheduler task. Each job is retried
//! on its own with jittered exponential backoff, so one failing bet never
//! holds up the others or the next round. Jobs that exhaust their attempts
//! are flagged on the [`ReconciliationQueue`] instead of being dropped.

use crate::{
    errors::StorageError,
    ledger::bounded,
    metrics::GameMetrics,
    store::LedgerStore,
    types::{Bet, BetId, RoundId, RoundRecord, UserId},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{Rng, RngCore};
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Work handed to the settlement worker
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementJob {
    /// Persist a bet in its terminal state
    ArchiveBet(Bet),
    /// Persist the summary of a finished round
    ArchiveRound(RoundRecord),
}

impl SettlementJob {
    fn round_id(&self) -> RoundId {
        match self {
            SettlementJob::ArchiveBet(bet) => bet.round_id,
            SettlementJob::ArchiveRound(record) => record.round_id,
        }
    }

    async fn run(&self, store: &dyn LedgerStore) -> Result<(), StorageError> {
        match self {
            SettlementJob::ArchiveBet(bet) => store.archive_bet(bet).await,
            SettlementJob::ArchiveRound(record) => store.archive_round(record).await,
        }
    }
}

/// Retry limits for settlement jobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub store_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            max_attempts: 5,
            store_timeout: Duration::from_secs(2),
            max_concurrency: 16,
        }
    }
}

/// Delay in `[backoff / 2, backoff]` ("equal jitter")
pub fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// A settlement job that needs manual attention
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconciliationEntry {
    pub id: u64,
    pub kind: &'static str,
    pub round_id: RoundId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bet_id: Option<BetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub attempts: u32,
    pub last_error: String,
    pub flagged_at: DateTime<Utc>,
}

/// In-memory queue of exhausted settlement jobs
#[derive(Debug, Default)]
pub struct ReconciliationQueue {
    entries: DashMap<u64, ReconciliationEntry>,
    next_id: AtomicU64,
}

impl ReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self, job: &SettlementJob, attempts: u32, last_error: String) -> ReconciliationEntry {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (kind, bet_id, user_id) = match job {
            SettlementJob::ArchiveBet(bet) => ("bet", Some(bet.id), Some(bet.user_id)),
            SettlementJob::ArchiveRound(_) => ("round", None, None),
        };
        let entry = ReconciliationEntry {
            id,
            kind,
            round_id: job.round_id(),
            bet_id,
            user_id,
            attempts,
            last_error,
            flagged_at: Utc::now(),
        };
        self.entries.insert(id, entry.clone());
        entry
    }

    /// Flagged entries, oldest first
    pub fn entries(&self) -> Vec<ReconciliationEntry> {
        let mut entries: Vec<ReconciliationEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Shared {
    store: Arc<dyn LedgerStore>,
    policy: RetryPolicy,
    metrics: GameMetrics,
    reconciliation: Arc<ReconciliationQueue>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn flag(&self, job: &SettlementJob, attempts: u32, last_error: String) {
        let entry = self.reconciliation.flag(job, attempts, last_error);
        self.metrics.reconciliation_flags_total.inc();
        error!(
            "Settlement of {} in round {} flagged for reconciliation after {} attempts: {}",
            entry.kind, entry.round_id, entry.attempts, entry.last_error
        );
    }

    fn finish(&self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.settlement_in_flight.set(remaining as i64);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, job: SettlementJob) {
        let mut backoff = self.policy.initial_backoff;
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            let result = bounded(self.policy.store_timeout, job.run(self.store.as_ref())).await;
            let err = match result {
                Ok(()) => {
                    debug!("Settlement job for round {} done after {} attempt(s)", job.round_id(), attempt);
                    return;
                }
                Err(e) => e,
            };

            if attempt == attempts {
                self.flag(&job, attempt, err.to_string());
                return;
            }

            self.metrics.settlement_retries_total.inc();
            let wait = jittered_backoff(&mut rand::thread_rng(), backoff);
            warn!(
                "Settlement job for round {} failed (attempt {}/{}): {}; retrying in {:?}",
                job.round_id(),
                attempt,
                attempts,
                err,
                wait
            );
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }
}

/// Submission side of the settlement worker
#[derive(Clone)]
pub struct SettlementHandle {
    tx: mpsc::UnboundedSender<SettlementJob>,
    shared: Arc<Shared>,
}

impl SettlementHandle {
    /// Queue a job without waiting for it
    pub fn submit(&self, job: SettlementJob) {
        let in_flight = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.metrics.settlement_in_flight.set(in_flight as i64);

        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            self.shared.flag(&job, 0, "settlement worker stopped".to_string());
            self.shared.finish();
        }
    }

    /// Flag a bet that can no longer be settled automatically
    pub fn flag_unsettled(&self, bet: Bet, reason: &str) {
        self.shared.flag(&SettlementJob::ArchiveBet(bet), 0, reason.to_string());
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn reconciliation(&self) -> Arc<ReconciliationQueue> {
        self.shared.reconciliation.clone()
    }

    /// Resolve once no submitted job is still running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct SettlementWorker;

impl SettlementWorker {
    pub fn spawn(
        store: Arc<dyn LedgerStore>,
        policy: RetryPolicy,
        metrics: GameMetrics,
        reconciliation: Arc<ReconciliationQueue>,
    ) -> (SettlementHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SettlementJob>();
        let shared = Arc::new(Shared {
            store,
            policy,
            metrics,
            reconciliation,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let worker = shared.clone();
        let task = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(worker.policy.max_concurrency.max(1)));
            while let Some(job) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let shared = worker.clone();
                tokio::spawn(async move {
                    shared.process(job).await;
                    drop(permit);
                    shared.finish();
                });
            }
            debug!("Settlement worker stopped");
        });

        (SettlementHandle { tx, shared }, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, types::UserId};
    use rand::{rngs::StdRng, SeedableRng};

    fn spawn_with(store: Arc<MemoryStore>) -> (SettlementHandle, GameMetrics) {
        let metrics = GameMetrics::new().unwrap();
        let (handle, _task) = SettlementWorker::spawn(
            store,
            RetryPolicy::default(),
            metrics.clone(),
            Arc::new(ReconciliationQueue::new()),
        );
        (handle, metrics)
    }

    fn lost_bet(id: u64) -> Bet {
        Bet::new(BetId(id), RoundId(1), UserId(id), 10).lost()
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1_000 {
            let delay = jittered_backoff(&mut rng, Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
        assert_eq!(jittered_backoff(&mut rng, Duration::from_millis(1)), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_archives(2);
        let (handle, metrics) = spawn_with(store.clone());

        handle.submit(SettlementJob::ArchiveBet(lost_bet(1)));
        handle.wait_idle().await;

        assert_eq!(store.round_bets(RoundId(1)).await.unwrap().len(), 1);
        assert_eq!(metrics.settlement_retries_total.get(), 2);
        assert!(handle.reconciliation().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_job_is_flagged() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_archives(5);
        let (handle, metrics) = spawn_with(store.clone());

        handle.submit(SettlementJob::ArchiveBet(lost_bet(7)));
        handle.wait_idle().await;

        let entries = handle.reconciliation().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bet_id, Some(BetId(7)));
        assert_eq!(entries[0].attempts, 5);
        assert_eq!(metrics.reconciliation_flags_total.get(), 1);
        assert!(store.round_bets(RoundId(1)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_archives(5);
        let (handle, _metrics) = spawn_with(store.clone());

        // first job absorbs every injected failure and is flagged
        handle.submit(SettlementJob::ArchiveBet(lost_bet(1)));
        tokio::task::yield_now().await;
        for id in 2..=4 {
            handle.submit(SettlementJob::ArchiveBet(lost_bet(id)));
        }
        handle.wait_idle().await;

        let archived = store.round_bets(RoundId(1)).await.unwrap().len();
        let flagged = handle.reconciliation().len();
        assert_eq!(archived + flagged, 4);
        assert!(flagged <= 1);
        assert_eq!(handle.in_flight(), 0);
    }
}
