//! Bet ledger for the live round
//!
//! The ledger owns balance mutations and bet status transitions. It is held
//! by the scheduler task and only ever called from there, so it needs no
//! locking of its own. In-memory bet state changes only after the store has
//! committed the matching batch.

use crate::{
    errors::{BetError, CrashResult, RoundStateError, StorageError},
    multiplier::Multiplier,
    store::{LedgerBatch, LedgerStore},
    types::{Bet, BetId, HistoryEntry, RoundId, UserId},
};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Aggregates of the bets in one round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTotals {
    pub total_bets: u32,
    pub total_wagered: u64,
    pub total_payout: u64,
}

pub struct BetLedger {
    store: Arc<dyn LedgerStore>,
    store_timeout: Duration,
    round_id: RoundId,
    accepting_bets: bool,
    next_bet_id: BetId,
    bets: HashMap<BetId, Bet>,
    by_user: HashMap<UserId, BetId>,
}

impl BetLedger {
    /// `last_bet_id` is the highest id already persisted
    pub fn new(store: Arc<dyn LedgerStore>, last_bet_id: BetId, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            round_id: RoundId(0),
            accepting_bets: false,
            next_bet_id: last_bet_id.next(),
            bets: HashMap::new(),
            by_user: HashMap::new(),
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Start tracking a new round and accept bets for it
    pub fn open_round(&mut self, round_id: RoundId) {
        self.round_id = round_id;
        self.accepting_bets = true;
        self.bets.clear();
        self.by_user.clear();
    }

    pub fn close_betting(&mut self) {
        self.accepting_bets = false;
    }

    /// Debit the stake and record the bet in one store batch
    pub async fn place_bet(&mut self, round_id: RoundId, user_id: UserId, amount: u64) -> CrashResult<Bet> {
        if round_id != self.round_id || !self.accepting_bets {
            return Err(RoundStateError::NotAcceptingBets(round_id).into());
        }
        if self.by_user.contains_key(&user_id) {
            return Err(BetError::DuplicateBet { round_id, user_id }.into());
        }

        // ids are consumed even when the store rejects the batch
        let bet_id = self.next_bet_id;
        self.next_bet_id = bet_id.next();

        let bet = Bet::new(bet_id, round_id, user_id, amount);
        let batch = LedgerBatch::new()
            .debit(user_id, amount)
            .append_history(HistoryEntry::bet_placed(&bet))
            .put_bet(bet.clone());
        self.commit(batch).await?;

        debug!("Bet {} placed by user {} in round {}: {}", bet_id, user_id, round_id, amount);
        self.by_user.insert(user_id, bet_id);
        self.bets.insert(bet_id, bet.clone());
        Ok(bet)
    }

    /// Lock in a win at `multiplier` and credit it in one store batch
    pub async fn settle_cashout(&mut self, bet_id: BetId, user_id: UserId, multiplier: Multiplier) -> CrashResult<Bet> {
        let bet = self.bets.get(&bet_id).ok_or(BetError::BetNotFound(bet_id))?;
        if bet.user_id != user_id {
            return Err(BetError::NotOwner { bet_id, user_id }.into());
        }
        if !bet.is_active() {
            return Err(BetError::BetNotActive(bet_id).into());
        }

        let settled = bet.cashed_out(multiplier);
        let batch = LedgerBatch::new()
            .credit(user_id, settled.win_amount)
            .append_history(HistoryEntry::cashed_out(&settled, multiplier))
            .put_bet(settled.clone());
        self.commit(batch).await?;

        debug!(
            "Bet {} cashed out at {} for {}",
            bet_id, multiplier, settled.win_amount
        );
        self.bets.insert(bet_id, settled.clone());
        Ok(settled)
    }

    /// Mark every still-active bet of the round as lost.
    ///
    /// No balance changes: stakes were debited at placement. The returned
    /// bets are handed to the settlement worker for archiving.
    pub fn settle_loss(&mut self, round_id: RoundId) -> Vec<Bet> {
        if round_id != self.round_id {
            return Vec::new();
        }
        self.accepting_bets = false;

        let mut lost: Vec<Bet> = self
            .bets
            .values_mut()
            .filter(|bet| bet.is_active())
            .map(|bet| {
                *bet = bet.lost();
                bet.clone()
            })
            .collect();
        lost.sort_by_key(|bet| bet.id);
        lost
    }

    pub fn bet(&self, bet_id: BetId) -> Option<&Bet> {
        self.bets.get(&bet_id)
    }

    /// Stakes debited but not yet cashed out or lost
    pub fn has_active_bets(&self) -> bool {
        self.bets.values().any(Bet::is_active)
    }

    /// Bets of the current round ordered by id
    pub fn bets(&self) -> Vec<Bet> {
        let mut bets: Vec<Bet> = self.bets.values().cloned().collect();
        bets.sort_by_key(|bet| bet.id);
        bets
    }

    pub fn totals(&self) -> RoundTotals {
        self.bets.values().fold(RoundTotals::default(), |mut totals, bet| {
            totals.total_bets += 1;
            totals.total_wagered = totals.total_wagered.saturating_add(bet.amount);
            totals.total_payout = totals.total_payout.saturating_add(bet.win_amount);
            totals
        })
    }

    async fn commit(&self, batch: LedgerBatch) -> Result<(), StorageError> {
        let result = bounded(self.store_timeout, self.store.apply(batch)).await;
        if let Err(ref e) = result {
            if !matches!(e, StorageError::InsufficientBalance { .. }) {
                warn!("Ledger write failed in round {}: {}", self.round_id, e);
            }
        }
        result
    }
}

/// Run a store call under a deadline
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(timeout.as_millis().min(u64::MAX as u128) as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::CrashError, store::MemoryStore, types::BetStatus};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn ledger_with(balances: &[(u64, u64)]) -> (Arc<MemoryStore>, BetLedger) {
        let store = Arc::new(MemoryStore::with_balances(
            balances.iter().map(|&(user, balance)| (UserId(user), balance)),
        ));
        let mut ledger = BetLedger::new(store.clone(), BetId(0), TIMEOUT);
        ledger.open_round(RoundId(1));
        (store, ledger)
    }

    #[tokio::test]
    async fn test_place_bet_debits_and_records() {
        let (store, mut ledger) = ledger_with(&[(1, 500)]);
        let bet = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap();

        assert_eq!(bet.id, BetId(1));
        assert_eq!(bet.status, BetStatus::Active);
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(400));
        assert_eq!(store.round_bets(RoundId(1)).await.unwrap().len(), 1);

        let history = store.history(UserId(1), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta, -100);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_store_untouched() {
        let (store, mut ledger) = ledger_with(&[(1, 50)]);
        let err = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap_err();

        assert!(matches!(err, CrashError::InsufficientBalance { balance: 50, required: 100, .. }));
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(50));
        assert!(store.round_bets(RoundId(1)).await.unwrap().is_empty());
        assert!(store.history(UserId(1), 10).await.unwrap().is_empty());
        assert!(ledger.bets().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_bet_rejected() {
        let (_store, mut ledger) = ledger_with(&[(1, 500)]);
        ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap();
        let err = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap_err();

        assert!(matches!(err, CrashError::Bet(BetError::DuplicateBet { .. })));
        assert_eq!(ledger.bets().len(), 1);
    }

    #[tokio::test]
    async fn test_bets_rejected_after_betting_closes() {
        let (_store, mut ledger) = ledger_with(&[(1, 500)]);
        ledger.close_betting();
        let err = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap_err();
        assert_eq!(err, CrashError::from(RoundStateError::NotAcceptingBets(RoundId(1))));

        let err = ledger.place_bet(RoundId(2), UserId(1), 100).await.unwrap_err();
        assert_eq!(err, CrashError::from(RoundStateError::NotAcceptingBets(RoundId(2))));
    }

    #[tokio::test]
    async fn test_cashout_credits_once() {
        let (store, mut ledger) = ledger_with(&[(1, 500)]);
        let bet = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap();
        ledger.close_betting();

        let settled = ledger
            .settle_cashout(bet.id, UserId(1), Multiplier::from_hundredths(200))
            .await
            .unwrap();
        assert_eq!(settled.win_amount, 200);
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(600));

        let err = ledger
            .settle_cashout(bet.id, UserId(1), Multiplier::from_hundredths(300))
            .await
            .unwrap_err();
        assert_eq!(err, CrashError::from(BetError::BetNotActive(bet.id)));
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(600));
        assert_eq!(store.history(UserId(1), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cashout_checks_owner_and_existence() {
        let (_store, mut ledger) = ledger_with(&[(1, 500), (2, 500)]);
        let bet = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap();

        let err = ledger
            .settle_cashout(bet.id, UserId(2), Multiplier::from_hundredths(150))
            .await
            .unwrap_err();
        assert!(matches!(err, CrashError::Bet(BetError::NotOwner { .. })));

        let err = ledger
            .settle_cashout(BetId(99), UserId(1), Multiplier::from_hundredths(150))
            .await
            .unwrap_err();
        assert_eq!(err, CrashError::from(BetError::BetNotFound(BetId(99))));
    }

    #[tokio::test]
    async fn test_failed_credit_keeps_bet_active() {
        let (store, mut ledger) = ledger_with(&[(1, 500)]);
        let bet = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap();

        store.fail_next_applies(1);
        let err = ledger
            .settle_cashout(bet.id, UserId(1), Multiplier::from_hundredths(150))
            .await
            .unwrap_err();
        assert!(matches!(err, CrashError::Storage(_)));
        assert!(ledger.bet(bet.id).unwrap().is_active());
        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(400));
    }

    #[tokio::test]
    async fn test_settle_loss_only_touches_active_bets() {
        let (store, mut ledger) = ledger_with(&[(1, 500), (2, 500)]);
        let a = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap();
        let b = ledger.place_bet(RoundId(1), UserId(2), 50).await.unwrap();
        ledger.close_betting();
        ledger
            .settle_cashout(a.id, UserId(1), Multiplier::from_hundredths(200))
            .await
            .unwrap();
        assert!(ledger.has_active_bets());

        let lost = ledger.settle_loss(RoundId(1));
        assert!(!ledger.has_active_bets());
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].id, b.id);
        assert_eq!(lost[0].win_amount, 0);
        assert_eq!(store.balance(UserId(2)).await.unwrap(), Some(450));

        let totals = ledger.totals();
        assert_eq!(totals.total_bets, 2);
        assert_eq!(totals.total_wagered, 150);
        assert_eq!(totals.total_payout, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout() {
        let (store, mut ledger) = ledger_with(&[(1, 500)]);
        store.set_apply_delay(Duration::from_secs(10));

        let err = ledger.place_bet(RoundId(1), UserId(1), 100).await.unwrap_err();
        assert_eq!(err, CrashError::from(StorageError::Timeout(2000)));
        assert!(ledger.bets().is_empty());
    }
}
