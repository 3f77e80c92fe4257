//! The layered unspent-output views.
//!
//! `Coins` is the per-transaction record of unspent outputs. Views stack:
//! a database-backed view at the bottom, the main in-memory cache above
//! it, and transient overlays on top for speculative block application.

use std::collections::HashMap;

use izzy_consensus::Hash256;
use izzy_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use izzy_primitives::transaction::{Transaction, TxOut};
use izzy_storage::StoreError;

/// Unspent outputs of one transaction; spent slots are `None`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coins {
    pub version: i32,
    pub coinbase: bool,
    pub coinstake: bool,
    pub height: i32,
    pub outputs: Vec<Option<TxOut>>,
}

impl Coins {
    pub fn from_tx(tx: &Transaction, height: i32) -> Self {
        Self {
            version: tx.version,
            coinbase: tx.is_coinbase(),
            coinstake: tx.is_coinstake(),
            height,
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    /// All outputs spent; such an entry must not reach the backing store.
    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(|output| output.is_none())
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.outputs
            .get(index as usize)
            .map(|output| output.is_some())
            .unwrap_or(false)
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(|o| o.as_ref())
    }

    /// Marks output `index` spent and returns it. Trailing spent slots
    /// are trimmed so the encoding stays canonical.
    pub fn spend(&mut self, index: u32) -> Option<TxOut> {
        let slot = self.outputs.get_mut(index as usize)?;
        let spent = slot.take();
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
        spent
    }

    /// Re-adds `output` at `index` while unwinding a block.
    pub fn restore(&mut self, index: u32, output: TxOut) {
        let index = index as usize;
        if self.outputs.len() <= index {
            self.outputs.resize(index + 1, None);
        }
        self.outputs[index] = Some(output);
    }

    /// Rough heap footprint, used for the cache high-water mark.
    pub fn memory_usage(&self) -> usize {
        let outputs: usize = self
            .outputs
            .iter()
            .map(|output| {
                40 + output
                    .as_ref()
                    .map(|out| out.script_pubkey.len())
                    .unwrap_or(0)
            })
            .sum();
        48 + outputs
    }
}

impl Encodable for Coins {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.version as u64);
        let mut flags = 0u8;
        if self.coinbase {
            flags |= 1;
        }
        if self.coinstake {
            flags |= 2;
        }
        encoder.write_u8(flags);
        encoder.write_varint(self.height as u64);
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(out) => {
                    encoder.write_u8(1);
                    out.consensus_encode(encoder);
                }
                None => encoder.write_u8(0),
            }
        }
    }
}

impl Decodable for Coins {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_varint()? as i32;
        let flags = decoder.read_u8()?;
        if flags & !3 != 0 {
            return Err(DecodeError::InvalidData("unknown coins flags"));
        }
        let height = decoder.read_varint()? as i32;
        let count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let present = decoder.read_u8()?;
            match present {
                0 => outputs.push(None),
                1 => outputs.push(Some(TxOut::consensus_decode(decoder)?)),
                _ => return Err(DecodeError::InvalidData("invalid output marker")),
            }
        }
        Ok(Self {
            version,
            coinbase: flags & 1 != 0,
            coinstake: flags & 2 != 0,
            height,
            outputs,
        })
    }
}

pub const COINS_DIRTY: u8 = 1 << 0;
pub const COINS_FRESH: u8 = 1 << 1;

#[derive(Clone, Debug)]
pub struct CoinsCacheEntry {
    pub coins: Coins,
    pub flags: u8,
}

impl CoinsCacheEntry {
    pub fn is_dirty(&self) -> bool {
        self.flags & COINS_DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & COINS_FRESH != 0
    }
}

pub type CoinsMap = HashMap<Hash256, CoinsCacheEntry>;

/// Contract shared by every layer of the view stack.
pub trait CoinsView {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, StoreError>;
    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, StoreError>;
    fn best_block(&self) -> Result<Option<Hash256>, StoreError>;
    /// Merges `coins` and the new best-block marker into this view in one
    /// atomic step.
    fn batch_write(
        &mut self,
        coins: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), StoreError>;
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        (**self).coins(txid)
    }

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        (**self).have_coins(txid)
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        (**self).best_block()
    }

    fn batch_write(
        &mut self,
        coins: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), StoreError> {
        (**self).batch_write(coins, best_block)
    }
}

/// Write-back cache over a lower view.
pub struct CoinsCache<V> {
    base: V,
    map: CoinsMap,
    best: Option<Hash256>,
    cached_bytes: usize,
}

impl<V: CoinsView> CoinsCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            map: CoinsMap::new(),
            best: None,
            cached_bytes: 0,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.map.len()
    }

    /// Approximate bytes held by cached entries.
    pub fn memory_usage(&self) -> usize {
        self.cached_bytes + self.map.len() * 64
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best = Some(hash);
    }

    /// Inserts the outputs of a new transaction. Entries the lower layers
    /// have never seen are FRESH and can be dropped wholesale once fully
    /// spent.
    pub fn add_tx_coins(&mut self, txid: Hash256, coins: Coins) -> Result<(), StoreError> {
        let fresh = !self.base_has(&txid)?;
        let mut flags = COINS_DIRTY;
        if fresh {
            flags |= COINS_FRESH;
        }
        self.insert_entry(txid, CoinsCacheEntry { coins, flags });
        Ok(())
    }

    /// Spends one output, returning it together with the entry's
    /// metadata and whether this spend fully pruned the entry.
    pub fn spend_output(
        &mut self,
        txid: &Hash256,
        index: u32,
    ) -> Result<Option<SpentOutput>, StoreError> {
        let mut entry = match self.take_entry(txid)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let output = match entry.coins.spend(index) {
            Some(output) => output,
            None => {
                // Not spendable: put the untouched entry back.
                self.insert_entry(*txid, entry);
                return Ok(None);
            }
        };
        let spent = SpentOutput {
            output,
            version: entry.coins.version,
            coinbase: entry.coins.coinbase,
            coinstake: entry.coins.coinstake,
            height: entry.coins.height,
            pruned: entry.coins.is_pruned(),
        };
        entry.flags |= COINS_DIRTY;
        if spent.pruned && entry.is_fresh() {
            // Never reached the layer below; forget it entirely.
        } else {
            self.insert_entry(*txid, entry);
        }
        Ok(Some(spent))
    }

    /// Reinstates a spent output while disconnecting a block. `meta`
    /// recreates the record when the spend had pruned it.
    pub fn restore_output(
        &mut self,
        txid: &Hash256,
        index: u32,
        output: TxOut,
        meta: Option<(i32, bool, bool, i32)>,
    ) -> Result<(), StoreError> {
        let mut entry = match self.take_entry(txid)? {
            Some(entry) => entry,
            None => {
                let (version, coinbase, coinstake, height) =
                    meta.unwrap_or((1, false, false, 0));
                CoinsCacheEntry {
                    coins: Coins {
                        version,
                        coinbase,
                        coinstake,
                        height,
                        outputs: Vec::new(),
                    },
                    flags: COINS_DIRTY,
                }
            }
        };
        entry.coins.restore(index, output);
        entry.flags |= COINS_DIRTY;
        self.insert_entry(*txid, entry);
        Ok(())
    }

    /// Drops a fully-spent transaction entry while disconnecting the
    /// block that created it.
    pub fn erase_coins(&mut self, txid: &Hash256) -> Result<(), StoreError> {
        if let Some(mut entry) = self.take_entry(txid)? {
            entry.coins.outputs.clear();
            entry.flags |= COINS_DIRTY;
            if !entry.is_fresh() {
                self.insert_entry(*txid, entry);
            }
        }
        Ok(())
    }

    /// Flushes DIRTY entries and the best-block marker to the layer
    /// below, emptying this cache.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let map = std::mem::take(&mut self.map);
        self.cached_bytes = 0;
        let dirty: CoinsMap = map
            .into_iter()
            .filter(|(_, entry)| entry.is_dirty())
            .collect();
        let best = self.best;
        self.base.batch_write(dirty, best)?;
        Ok(())
    }

    pub fn into_base(self) -> V {
        self.base
    }

    fn base_has(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        if let Some(entry) = self.map.get(txid) {
            return Ok(!entry.coins.is_pruned());
        }
        self.base.have_coins(txid)
    }

    fn insert_entry(&mut self, txid: Hash256, entry: CoinsCacheEntry) {
        self.cached_bytes += entry.coins.memory_usage();
        if let Some(old) = self.map.insert(txid, entry) {
            self.cached_bytes = self.cached_bytes.saturating_sub(old.coins.memory_usage());
        }
    }

    fn take_entry(&mut self, txid: &Hash256) -> Result<Option<CoinsCacheEntry>, StoreError> {
        if let Some(entry) = self.map.remove(txid) {
            self.cached_bytes = self.cached_bytes.saturating_sub(entry.coins.memory_usage());
            return Ok(Some(entry));
        }
        match self.base.coins(txid)? {
            Some(coins) => Ok(Some(CoinsCacheEntry { coins, flags: 0 })),
            None => Ok(None),
        }
    }
}

/// One spent output plus what is needed to undo the spend.
#[derive(Clone, Debug)]
pub struct SpentOutput {
    pub output: TxOut,
    pub version: i32,
    pub coinbase: bool,
    pub coinstake: bool,
    pub height: i32,
    /// The spend removed the last unspent output of the transaction.
    pub pruned: bool,
}

impl<V: CoinsView> CoinsView for CoinsCache<V> {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        if let Some(entry) = self.map.get(txid) {
            if entry.coins.is_pruned() {
                return Ok(None);
            }
            return Ok(Some(entry.coins.clone()));
        }
        match self.base.coins(txid)? {
            Some(coins) => {
                // Cache a clean copy for later hits.
                self.insert_entry(
                    *txid,
                    CoinsCacheEntry {
                        coins: coins.clone(),
                        flags: 0,
                    },
                );
                Ok(Some(coins))
            }
            None => Ok(None),
        }
    }

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        if let Some(entry) = self.map.get(txid) {
            return Ok(!entry.coins.is_pruned());
        }
        self.base.have_coins(txid)
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        if self.best.is_some() {
            return Ok(self.best);
        }
        self.base.best_block()
    }

    fn batch_write(
        &mut self,
        coins: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), StoreError> {
        for (txid, incoming) in coins {
            if !incoming.is_dirty() {
                continue;
            }
            let existing = self.map.remove(&txid);
            if let Some(old) = &existing {
                self.cached_bytes = self.cached_bytes.saturating_sub(old.coins.memory_usage());
            }

            let fresh_below = match &existing {
                Some(old) => old.is_fresh(),
                None => incoming.is_fresh(),
            };
            if incoming.coins.is_pruned() && fresh_below {
                // A pruned FRESH entry never existed below this layer;
                // drop it without propagating.
                continue;
            }

            let mut flags = COINS_DIRTY;
            if fresh_below {
                flags |= COINS_FRESH;
            }
            self.insert_entry(
                txid,
                CoinsCacheEntry {
                    coins: incoming.coins,
                    flags,
                },
            );
        }
        if best_block.is_some() {
            self.best = best_block;
        }
        Ok(())
    }
}
