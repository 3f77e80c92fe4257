//! Database-backed bottom layer of the coins view stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use izzy_consensus::{Amount, Hash256};
use izzy_primitives::encoding::{decode, encode, Encodable, Encoder};
use izzy_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use sha2::{Digest, Sha256};

use crate::coins::{Coins, CoinsMap, CoinsView};

const BEST_BLOCK_KEY: &[u8] = b"B";

pub struct CoinsDb<S> {
    store: Arc<S>,
}

impl<S> CoinsDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: KeyValueStore> CoinsView for CoinsDb<S> {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        let bytes = match self.store.get(Column::Coins, txid)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        decode::<Coins>(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Coins, txid)?.is_some())
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        let bytes = match self.store.get(Column::CoinsMeta, BEST_BLOCK_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid best block record".to_string()))?;
        Ok(Some(hash))
    }

    fn batch_write(
        &mut self,
        coins: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.reserve(coins.len() + 1);
        let mut changed = 0usize;
        for (txid, entry) in &coins {
            if entry.coins.is_pruned() {
                batch.delete(Column::Coins, txid);
            } else {
                batch.put(Column::Coins, txid, encode(&entry.coins));
            }
            changed += 1;
        }
        if let Some(best) = best_block {
            batch.put(Column::CoinsMeta, BEST_BLOCK_KEY, best);
        }
        izzy_log::log_debug!("committing {changed} changed transactions to coin database");
        self.store.write_batch(&batch)
    }
}

/// Commitment over the whole persisted coin set, used by consistency
/// checks and tests.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoinStats {
    pub best_block: Option<Hash256>,
    pub transactions: u64,
    pub outputs: u64,
    pub serialized_size: u64,
    pub hash_serialized: Hash256,
    pub total_amount: Amount,
}

#[derive(Debug)]
pub enum CoinStatsError {
    Store(StoreError),
    Interrupted,
}

impl std::fmt::Display for CoinStatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinStatsError::Store(err) => write!(f, "{err}"),
            CoinStatsError::Interrupted => write!(f, "coin statistics interrupted"),
        }
    }
}

impl std::error::Error for CoinStatsError {}

impl From<StoreError> for CoinStatsError {
    fn from(err: StoreError) -> Self {
        CoinStatsError::Store(err)
    }
}

/// Iterates the backing store in key order, hashing every live record
/// into a single commitment. Polls `interrupt` between records.
pub fn coin_stats<S: KeyValueStore>(
    db: &CoinsDb<S>,
    interrupt: &AtomicBool,
) -> Result<CoinStats, CoinStatsError> {
    let mut stats = CoinStats {
        best_block: db.best_block()?,
        ..CoinStats::default()
    };

    let mut hasher = Sha256::new();
    if let Some(best) = stats.best_block {
        hasher.update(best);
    }

    let mut total: Amount = 0;
    let mut interrupted = false;
    let walk = db.store().for_each_prefix(Column::Coins, &[], &mut |key, value| {
        if interrupt.load(Ordering::Relaxed) {
            interrupted = true;
            return Err(StoreError::Backend("interrupted".to_string()));
        }
        let coins: Coins =
            decode(value).map_err(|err| StoreError::Backend(err.to_string()))?;

        let mut record = Encoder::new();
        record.write_bytes(key);
        record.write_varint(coins.version as u64);
        record.write_u8(if coins.coinbase { b'c' } else { b'n' });
        record.write_varint(coins.height as u64);
        stats.transactions += 1;
        for (index, output) in coins.outputs.iter().enumerate() {
            if let Some(out) = output {
                stats.outputs += 1;
                record.write_varint(index as u64 + 1);
                out.consensus_encode(&mut record);
                total += out.value;
            }
        }
        record.write_varint(0);
        hasher.update(record.into_inner());
        stats.serialized_size += 32 + value.len() as u64;
        Ok(())
    });
    if let Err(err) = walk {
        if interrupted {
            return Err(CoinStatsError::Interrupted);
        }
        return Err(CoinStatsError::Store(err));
    }

    let first: Hash256 = hasher.finalize().into();
    stats.hash_serialized = Sha256::digest(first).into();
    stats.total_amount = total;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{CoinsCache, CoinsCacheEntry, COINS_DIRTY};
    use izzy_primitives::transaction::{Transaction, TxIn, TxOut};
    use izzy_primitives::OutPoint;
    use izzy_storage::memory::MemoryStore;

    fn coins_for(tag: u8, values: &[i64]) -> (Hash256, Coins) {
        let tx = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([tag; 32], 0), vec![0x01])],
            vout: values
                .iter()
                .map(|value| TxOut::new(*value, vec![0x51, tag]))
                .collect(),
            lock_time: 0,
        };
        (tx.txid(), Coins::from_tx(&tx, 7))
    }

    #[test]
    fn round_trips_through_store() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(store);
        let (txid, coins) = coins_for(1, &[10, 20]);

        let mut map = CoinsMap::new();
        map.insert(
            txid,
            CoinsCacheEntry {
                coins: coins.clone(),
                flags: COINS_DIRTY,
            },
        );
        db.batch_write(map, Some([3u8; 32])).expect("write");

        assert_eq!(db.coins(&txid).expect("get"), Some(coins));
        assert!(db.have_coins(&txid).expect("have"));
        assert_eq!(db.best_block().expect("best"), Some([3u8; 32]));
    }

    #[test]
    fn pruned_entries_are_deleted() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(store);
        let (txid, coins) = coins_for(2, &[10]);

        let mut map = CoinsMap::new();
        map.insert(
            txid,
            CoinsCacheEntry {
                coins,
                flags: COINS_DIRTY,
            },
        );
        db.batch_write(map, None).expect("write");
        assert!(db.have_coins(&txid).expect("have"));

        let (_, mut pruned) = coins_for(2, &[10]);
        pruned.spend(0);
        let mut map = CoinsMap::new();
        map.insert(
            txid,
            CoinsCacheEntry {
                coins: pruned,
                flags: COINS_DIRTY,
            },
        );
        db.batch_write(map, None).expect("write");
        assert!(!db.have_coins(&txid).expect("have"));
    }

    #[test]
    fn stats_commit_to_content() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(store);
        let interrupt = AtomicBool::new(false);

        let empty = coin_stats(&db, &interrupt).expect("stats");
        assert_eq!(empty.transactions, 0);
        assert_eq!(empty.total_amount, 0);

        let (txid_a, coins_a) = coins_for(3, &[10, 30]);
        let (txid_b, coins_b) = coins_for(4, &[5]);
        let mut map = CoinsMap::new();
        map.insert(
            txid_a,
            CoinsCacheEntry {
                coins: coins_a,
                flags: COINS_DIRTY,
            },
        );
        map.insert(
            txid_b,
            CoinsCacheEntry {
                coins: coins_b,
                flags: COINS_DIRTY,
            },
        );
        db.batch_write(map, Some([1u8; 32])).expect("write");

        let stats = coin_stats(&db, &interrupt).expect("stats");
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.outputs, 3);
        assert_eq!(stats.total_amount, 45);
        assert_ne!(stats.hash_serialized, empty.hash_serialized);

        // Same content hashes the same; identical runs agree.
        let again = coin_stats(&db, &interrupt).expect("stats");
        assert_eq!(again, stats);
    }

    #[test]
    fn stats_honour_interrupt() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(store);
        let (txid, coins) = coins_for(5, &[10]);
        let mut map = CoinsMap::new();
        map.insert(
            txid,
            CoinsCacheEntry {
                coins,
                flags: COINS_DIRTY,
            },
        );
        db.batch_write(map, None).expect("write");

        let interrupt = AtomicBool::new(true);
        assert!(matches!(
            coin_stats(&db, &interrupt),
            Err(CoinStatsError::Interrupted)
        ));
    }

    #[test]
    fn cache_flush_lands_in_store() {
        let store = Arc::new(MemoryStore::new());
        let db = CoinsDb::new(Arc::clone(&store));
        let mut cache = CoinsCache::new(db);

        let (txid, coins) = coins_for(6, &[77]);
        cache.add_tx_coins(txid, coins.clone()).expect("add");
        cache.set_best_block([8u8; 32]);
        cache.flush().expect("flush");

        let mut db = CoinsDb::new(store);
        assert_eq!(db.coins(&txid).expect("get"), Some(coins));
        assert_eq!(db.best_block().expect("best"), Some([8u8; 32]));
    }
}
