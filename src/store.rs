//! Balance store, history sink and round archive
//!
//! [`LedgerStore`] is the narrow transactional interface the ledger and the
//! settlement worker talk to. [`MemoryStore`] backs tests and the demo
//! binary; [`crate::storage::RocksStore`] persists to RocksDB.

use crate::{
    errors::StorageError,
    types::{Bet, BetId, HistoryEntry, RoundId, RoundRecord, UserId},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

/// One step of an atomic ledger write
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOp {
    /// Fails the whole batch when the balance is too low or the user is unknown
    Debit { user_id: UserId, amount: u64 },
    /// Creates the balance row when missing
    Credit { user_id: UserId, amount: u64 },
    AppendHistory(HistoryEntry),
    PutBet(Bet),
}

/// Ordered ops applied all-or-nothing by [`LedgerStore::apply`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerBatch {
    ops: Vec<LedgerOp>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debit(mut self, user_id: UserId, amount: u64) -> Self {
        self.ops.push(LedgerOp::Debit { user_id, amount });
        self
    }

    pub fn credit(mut self, user_id: UserId, amount: u64) -> Self {
        self.ops.push(LedgerOp::Credit { user_id, amount });
        self
    }

    pub fn append_history(mut self, entry: HistoryEntry) -> Self {
        self.ops.push(LedgerOp::AppendHistory(entry));
        self
    }

    pub fn put_bet(mut self, bet: Bet) -> Self {
        self.ops.push(LedgerOp::PutBet(bet));
        self
    }

    pub fn ops(&self) -> &[LedgerOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resulting balances of every touched user, validated against `current`.
    ///
    /// Shared by the store implementations so debit checks behave the same.
    pub fn resolve_balances<F>(&self, mut current: F) -> Result<HashMap<UserId, u64>, StorageError>
    where
        F: FnMut(UserId) -> Result<Option<u64>, StorageError>,
    {
        let mut pending: HashMap<UserId, u64> = HashMap::new();
        for op in &self.ops {
            match *op {
                LedgerOp::Debit { user_id, amount } => {
                    let balance = match pending.get(&user_id) {
                        Some(b) => *b,
                        None => current(user_id)?.ok_or(StorageError::UserNotFound(user_id))?,
                    };
                    if balance < amount {
                        return Err(StorageError::InsufficientBalance {
                            user_id,
                            balance,
                            required: amount,
                        });
                    }
                    pending.insert(user_id, balance - amount);
                }
                LedgerOp::Credit { user_id, amount } => {
                    let balance = match pending.get(&user_id) {
                        Some(b) => *b,
                        None => current(user_id)?.unwrap_or(0),
                    };
                    pending.insert(user_id, balance.saturating_add(amount));
                }
                LedgerOp::AppendHistory(_) | LedgerOp::PutBet(_) => {}
            }
        }
        Ok(pending)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn balance(&self, user_id: UserId) -> Result<Option<u64>, StorageError>;

    /// Apply every op of the batch or none of them
    async fn apply(&self, batch: LedgerBatch) -> Result<(), StorageError>;

    /// Idempotent upsert of a bet in its terminal state
    async fn archive_bet(&self, bet: &Bet) -> Result<(), StorageError>;

    /// Idempotent upsert of a finished round
    async fn archive_round(&self, record: &RoundRecord) -> Result<(), StorageError>;

    /// Archived rounds, newest first
    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StorageError>;

    async fn round_bets(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError>;

    async fn user_bets(&self, user_id: UserId) -> Result<Vec<Bet>, StorageError>;

    /// Points history of a user, newest first
    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Highest round and bet ids ever written
    async fn last_ids(&self) -> Result<(RoundId, BetId), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<UserId, u64>,
    bets: BTreeMap<BetId, Bet>,
    rounds: BTreeMap<RoundId, RoundRecord>,
    history: Vec<HistoryEntry>,
}

/// In-memory store with failure injection for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_applies: AtomicU32,
    fail_archives: AtomicU32,
    apply_delay_ms: AtomicU64,
    applied_batches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with user balances
    pub fn with_balances(balances: impl IntoIterator<Item = (UserId, u64)>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            state.balances.extend(balances);
        }
        store
    }

    /// Fail the next `count` calls to `apply` with a write error
    pub fn fail_next_applies(&self, count: u32) {
        self.fail_applies.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` archive calls with a write error
    pub fn fail_next_archives(&self, count: u32) {
        self.fail_archives.store(count, Ordering::SeqCst);
    }

    /// Delay every `apply` call, used to exercise store timeouts
    pub fn set_apply_delay(&self, delay: Duration) {
        self.apply_delay_ms
            .store(delay.as_millis().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }

    /// Number of batches that were committed
    pub fn applied_batches(&self) -> u64 {
        self.applied_batches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::ReadFailed("memory store lock poisoned".to_string()))
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn balance(&self, user_id: UserId) -> Result<Option<u64>, StorageError> {
        Ok(self.lock()?.balances.get(&user_id).copied())
    }

    async fn apply(&self, batch: LedgerBatch) -> Result<(), StorageError> {
        let delay = self.apply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if Self::take_fault(&self.fail_applies) {
            return Err(StorageError::WriteFailed("injected apply failure".to_string()));
        }

        let mut state = self.lock()?;
        let balances = batch.resolve_balances(|user_id| Ok(state.balances.get(&user_id).copied()))?;

        state.balances.extend(balances);
        for op in batch.ops {
            match op {
                LedgerOp::AppendHistory(entry) => state.history.push(entry),
                LedgerOp::PutBet(bet) => {
                    state.bets.insert(bet.id, bet);
                }
                LedgerOp::Debit { .. } | LedgerOp::Credit { .. } => {}
            }
        }
        self.applied_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn archive_bet(&self, bet: &Bet) -> Result<(), StorageError> {
        if Self::take_fault(&self.fail_archives) {
            return Err(StorageError::WriteFailed(format!("injected archive failure for bet {}", bet.id)));
        }
        self.lock()?.bets.insert(bet.id, bet.clone());
        Ok(())
    }

    async fn archive_round(&self, record: &RoundRecord) -> Result<(), StorageError> {
        if Self::take_fault(&self.fail_archives) {
            return Err(StorageError::WriteFailed(format!(
                "injected archive failure for round {}",
                record.round_id
            )));
        }
        self.lock()?.rounds.insert(record.round_id, record.clone());
        Ok(())
    }

    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StorageError> {
        Ok(self.lock()?.rounds.values().rev().take(limit).cloned().collect())
    }

    async fn round_bets(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError> {
        Ok(self
            .lock()?
            .bets
            .values()
            .filter(|bet| bet.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn user_bets(&self, user_id: UserId) -> Result<Vec<Bet>, StorageError> {
        Ok(self
            .lock()?
            .bets
            .values()
            .filter(|bet| bet.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self
            .lock()?
            .history
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_ids(&self) -> Result<(RoundId, BetId), StorageError> {
        let state = self.lock()?;
        let last_round = state
            .rounds
            .keys()
            .copied()
            .chain(state.bets.values().map(|bet| bet.round_id))
            .max()
            .unwrap_or(RoundId(0));
        let last_bet = state.bets.keys().next_back().copied().unwrap_or(BetId(0));
        Ok((last_round, last_bet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet(id: u64, round: u64, user: u64, amount: u64) -> Bet {
        Bet::new(BetId(id), RoundId(round), UserId(user), amount)
    }

    #[tokio::test]
    async fn test_failed_debit_applies_nothing() {
        let store = MemoryStore::with_balances([(UserId(1), 50)]);
        let b = bet(1, 1, 1, 80);
        let batch = LedgerBatch::new()
            .debit(UserId(1), 80)
            .append_history(HistoryEntry::bet_placed(&b))
            .put_bet(b);

        let err = store.apply(batch).await.unwrap_err();
        assert!(matches!(err, StorageError::InsufficientBalance { balance: 50, required: 80, .. }));
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(50));
        assert!(store.round_bets(RoundId(1)).await.unwrap().is_empty());
        assert!(store.history(UserId(1), 10).await.unwrap().is_empty());
        assert_eq!(store.applied_batches(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_debit() {
        let store = MemoryStore::new();
        let err = store.apply(LedgerBatch::new().debit(UserId(9), 1)).await.unwrap_err();
        assert_eq!(err, StorageError::UserNotFound(UserId(9)));
    }

    #[tokio::test]
    async fn test_credit_creates_balance() {
        let store = MemoryStore::new();
        store.apply(LedgerBatch::new().credit(UserId(4), 500)).await.unwrap();
        assert_eq!(store.balance(UserId(4)).await.unwrap(), Some(500));
    }

    #[tokio::test]
    async fn test_debits_within_batch_accumulate() {
        let store = MemoryStore::with_balances([(UserId(1), 100)]);
        let batch = LedgerBatch::new().debit(UserId(1), 60).debit(UserId(1), 60);
        assert!(store.apply(batch).await.is_err());
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_archives(1);
        let b = bet(1, 1, 1, 10).lost();

        assert!(store.archive_bet(&b).await.is_err());
        assert!(store.archive_bet(&b).await.is_ok());
        assert_eq!(store.round_bets(RoundId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_ids_include_unarchived_rounds() {
        let store = MemoryStore::with_balances([(UserId(1), 100)]);
        store
            .apply(LedgerBatch::new().debit(UserId(1), 10).put_bet(bet(7, 3, 1, 10)))
            .await
            .unwrap();
        assert_eq!(store.last_ids().await.unwrap(), (RoundId(3), BetId(7)));
    }
}
