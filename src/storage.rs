//! RocksDB-backed ledger store

use crate::{
    errors::StorageError,
    store::{LedgerBatch, LedgerOp, LedgerStore},
    types::{Bet, BetId, HistoryEntry, RoundId, RoundRecord, UserId},
};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Arc};
use tokio::sync::Mutex;

const BALANCE_PREFIX: &[u8] = b"balance:";
const BET_PREFIX: &[u8] = b"bet:";
const ROUND_PREFIX: &[u8] = b"round:";
const ROUND_BETS_PREFIX: &[u8] = b"round_bets:";
const USER_BETS_PREFIX: &[u8] = b"user_bets:";
const HISTORY_PREFIX: &[u8] = b"history:";
const LAST_ROUND_KEY: &[u8] = b"meta:last_round";
const LAST_BET_KEY: &[u8] = b"meta:last_bet";
const HISTORY_SEQ_KEY: &[u8] = b"meta:history_seq";

fn key(prefix: &[u8], parts: &[u64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + parts.len() * 8);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(&part.to_be_bytes());
    }
    key
}

// Newest-first ordering uses inverted ids as the sort key
fn inverted(id: u64) -> u64 {
    u64::MAX - id
}

fn round_key(round_id: RoundId) -> Vec<u8> {
    key(ROUND_PREFIX, &[inverted(round_id.0)])
}

fn bet_key(bet_id: BetId) -> Vec<u8> {
    key(BET_PREFIX, &[bet_id.0])
}

fn round_bet_index_key(bet: &Bet) -> Vec<u8> {
    key(ROUND_BETS_PREFIX, &[bet.round_id.0, bet.id.0])
}

fn user_bet_index_key(bet: &Bet) -> Vec<u8> {
    key(USER_BETS_PREFIX, &[bet.user_id.0, bet.id.0])
}

fn history_key(user_id: UserId, seq: u64) -> Vec<u8> {
    key(HISTORY_PREFIX, &[user_id.0, inverted(seq)])
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::WriteFailed(format!("encode failed: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::CorruptedData(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Persistent store using one RocksDB instance.
///
/// Every ledger batch becomes a single `WriteBatch`, so balance changes,
/// history rows and bet rows land together or not at all.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
    // Serializes read-validate-write of balances and counters
    write_lock: Arc<Mutex<()>>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64, StorageError> {
        match self.get(key)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn load_bets_from_index(&self, prefix: &[u8]) -> Result<Vec<Bet>, StorageError> {
        let mut bets = Vec::new();
        for (key, _) in self.scan_prefix(prefix, usize::MAX)? {
            let bet_id = decode_u64(&key[key.len() - 8..])?;
            if let Some(bytes) = self.get(&bet_key(BetId(bet_id)))? {
                bets.push(decode(&bytes)?);
            }
        }
        Ok(bets)
    }

    /// Queue a bet row, its indexes and the id high-water mark
    fn stage_bet(&self, batch: &mut WriteBatch, bet: &Bet, last_ids: &mut (u64, u64)) -> Result<(), StorageError> {
        batch.put(bet_key(bet.id), encode(bet)?);
        batch.put(round_bet_index_key(bet), b"");
        batch.put(user_bet_index_key(bet), b"");
        last_ids.0 = last_ids.0.max(bet.round_id.0);
        last_ids.1 = last_ids.1.max(bet.id.0);
        Ok(())
    }

    fn stage_last_ids(&self, batch: &mut WriteBatch, before: (u64, u64), after: (u64, u64)) {
        if after.0 > before.0 {
            batch.put(LAST_ROUND_KEY, after.0.to_be_bytes());
        }
        if after.1 > before.1 {
            batch.put(LAST_BET_KEY, after.1.to_be_bytes());
        }
    }

    fn current_last_ids(&self) -> Result<(u64, u64), StorageError> {
        Ok((self.get_u64(LAST_ROUND_KEY)?, self.get_u64(LAST_BET_KEY)?))
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    async fn balance(&self, user_id: UserId) -> Result<Option<u64>, StorageError> {
        self.get(&key(BALANCE_PREFIX, &[user_id.0]))?
            .map(|bytes| decode_u64(&bytes))
            .transpose()
    }

    async fn apply(&self, batch: LedgerBatch) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let balances = batch.resolve_balances(|user_id| {
            self.get(&key(BALANCE_PREFIX, &[user_id.0]))?
                .map(|bytes| decode_u64(&bytes))
                .transpose()
        })?;

        let mut write = WriteBatch::default();
        for (user_id, balance) in &balances {
            write.put(key(BALANCE_PREFIX, &[user_id.0]), balance.to_be_bytes());
        }

        let before = self.current_last_ids()?;
        let mut after = before;
        let mut seq = self.get_u64(HISTORY_SEQ_KEY)?;
        let start_seq = seq;

        for op in batch.ops() {
            match op {
                LedgerOp::AppendHistory(entry) => {
                    seq += 1;
                    write.put(history_key(entry.user_id, seq), encode(entry)?);
                }
                LedgerOp::PutBet(bet) => self.stage_bet(&mut write, bet, &mut after)?,
                LedgerOp::Debit { .. } | LedgerOp::Credit { .. } => {}
            }
        }
        if seq != start_seq {
            write.put(HISTORY_SEQ_KEY, seq.to_be_bytes());
        }
        self.stage_last_ids(&mut write, before, after);

        self.db.write(write)?;
        Ok(())
    }

    async fn archive_bet(&self, bet: &Bet) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let before = self.current_last_ids()?;
        let mut after = before;
        let mut write = WriteBatch::default();
        self.stage_bet(&mut write, bet, &mut after)?;
        self.stage_last_ids(&mut write, before, after);

        self.db.write(write)?;
        Ok(())
    }

    async fn archive_round(&self, record: &RoundRecord) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let before = self.current_last_ids()?;
        let after = (before.0.max(record.round_id.0), before.1);
        let mut write = WriteBatch::default();
        write.put(round_key(record.round_id), encode(record)?);
        self.stage_last_ids(&mut write, before, after);

        self.db.write(write)?;
        Ok(())
    }

    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StorageError> {
        self.scan_prefix(ROUND_PREFIX, limit)?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    async fn round_bets(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError> {
        self.load_bets_from_index(&key(ROUND_BETS_PREFIX, &[round_id.0]))
    }

    async fn user_bets(&self, user_id: UserId) -> Result<Vec<Bet>, StorageError> {
        self.load_bets_from_index(&key(USER_BETS_PREFIX, &[user_id.0]))
    }

    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        self.scan_prefix(&key(HISTORY_PREFIX, &[user_id.0]), limit)?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    async fn last_ids(&self) -> Result<(RoundId, BetId), StorageError> {
        let (round, bet) = self.current_last_ids()?;
        Ok((RoundId(round), BetId(bet)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplier::Multiplier;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(round: u64) -> RoundRecord {
        RoundRecord {
            round_id: RoundId(round),
            crash_point: Multiplier::from_hundredths(250),
            final_multiplier: Multiplier::from_hundredths(250),
            server_seed: "00".repeat(32),
            seed_hash: "ab".repeat(32),
            started_at: Some(Utc::now()),
            crashed_at: Utc::now(),
            total_bets: 0,
            total_wagered: 0,
            total_payout: 0,
            forced: false,
        }
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.apply(LedgerBatch::new().credit(UserId(1), 100)).await.unwrap();

        let bet = Bet::new(BetId(1), RoundId(1), UserId(1), 150);
        let batch = LedgerBatch::new()
            .debit(UserId(1), 150)
            .append_history(HistoryEntry::bet_placed(&bet))
            .put_bet(bet);
        assert!(matches!(
            store.apply(batch).await,
            Err(StorageError::InsufficientBalance { .. })
        ));

        assert_eq!(store.balance(UserId(1)).await.unwrap(), Some(100));
        assert!(store.round_bets(RoundId(1)).await.unwrap().is_empty());
        assert!(store.history(UserId(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bet_and_history_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.apply(LedgerBatch::new().credit(UserId(2), 1_000)).await.unwrap();

            let bet = Bet::new(BetId(5), RoundId(3), UserId(2), 100);
            store
                .apply(
                    LedgerBatch::new()
                        .debit(UserId(2), 100)
                        .append_history(HistoryEntry::bet_placed(&bet))
                        .put_bet(bet.clone()),
                )
                .await
                .unwrap();

            let won = bet.cashed_out(Multiplier::from_hundredths(200));
            store
                .apply(
                    LedgerBatch::new()
                        .credit(UserId(2), won.win_amount)
                        .append_history(HistoryEntry::cashed_out(&won, Multiplier::from_hundredths(200)))
                        .put_bet(won),
                )
                .await
                .unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.balance(UserId(2)).await.unwrap(), Some(1_100));
        assert_eq!(store.last_ids().await.unwrap(), (RoundId(3), BetId(5)));

        let history = store.history(UserId(2), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].delta, 200);
        assert_eq!(history[1].delta, -100);

        let bets = store.user_bets(UserId(2)).await.unwrap();
        assert_eq!(bets.len(), 1);
        assert_eq!(bets[0].win_amount, 200);
    }

    #[tokio::test]
    async fn test_recent_rounds_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for round in [1, 3, 2] {
            store.archive_round(&record(round)).await.unwrap();
        }
        // idempotent upsert
        store.archive_round(&record(3)).await.unwrap();

        let rounds = store.recent_rounds(10).await.unwrap();
        let ids: Vec<u64> = rounds.iter().map(|r| r.round_id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(store.recent_rounds(2).await.unwrap().len(), 2);
        assert_eq!(store.last_ids().await.unwrap().0, RoundId(3));
    }
}
