//! Block-tree database records and the index load path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use izzy_consensus::{ChainParams, Hash256};
use izzy_pow::check_proof_of_work;
use izzy_primitives::encoding::{DecodeError, Decoder, Encoder};
use izzy_primitives::outpoint::OutPoint;
use izzy_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::tree::{BlockIndexEntry, BlockStake, BlockTree};
use primitive_types::U256;

const LAST_FILE_KEY: &[u8] = b"l";
const REINDEX_KEY: &[u8] = b"R";
const FLAG_PREFIX: u8 = b'F';
const INT_PREFIX: u8 = b'I';

/// Per-file bookkeeping for the external flat files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u32,
    pub undo_size: u32,
    pub height_first: u32,
    pub height_last: u32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: u32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    pub fn encode(&self) -> [u8; 28] {
        let mut out = [0u8; 28];
        out[0..4].copy_from_slice(&self.blocks.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.undo_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.height_first.to_le_bytes());
        out[16..20].copy_from_slice(&self.height_last.to_le_bytes());
        out[20..24].copy_from_slice(&self.time_first.to_le_bytes());
        out[24..28].copy_from_slice(&self.time_last.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 28 {
            return None;
        }
        Some(Self {
            blocks: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            size: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            undo_size: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            height_first: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
            height_last: u32::from_le_bytes(bytes[16..20].try_into().ok()?),
            time_first: u32::from_le_bytes(bytes[20..24].try_into().ok()?),
            time_last: u32::from_le_bytes(bytes[24..28].try_into().ok()?),
        })
    }
}

/// On-disk form of a block-index entry. The next-hash field is stored for
/// format compatibility but the in-memory forward link is always
/// recomputed from the active chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskBlockIndex {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub next_hash: Hash256,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub accumulator_checkpoint: Hash256,
    pub chain_work: [u8; 32],
    pub mint: i64,
    pub money_supply: i64,
    pub stake: Option<BlockStake>,
    pub stake_modifier: u64,
    pub proof_of_stake_hash: Hash256,
    pub lottery_winners: Vec<Hash256>,
}

impl DiskBlockIndex {
    pub fn from_entry(entry: &BlockIndexEntry, prev_hash: Hash256, next_hash: Hash256) -> Self {
        Self {
            hash: entry.hash,
            prev_hash,
            next_hash,
            height: entry.height,
            status: entry.status,
            tx_count: entry.tx_count,
            file: entry.file,
            data_pos: entry.data_pos,
            undo_pos: entry.undo_pos,
            version: entry.version,
            merkle_root: entry.merkle_root,
            time: entry.time,
            bits: entry.bits,
            nonce: entry.nonce,
            accumulator_checkpoint: entry.accumulator_checkpoint,
            chain_work: entry.chain_work.to_little_endian(),
            mint: entry.mint,
            money_supply: entry.money_supply,
            stake: entry.stake,
            stake_modifier: entry.stake_modifier,
            proof_of_stake_hash: entry.proof_of_stake_hash,
            lottery_winners: entry.lottery_winners.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.prev_hash);
        encoder.write_hash(&self.next_hash);
        encoder.write_varint(self.height as u64);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        encoder.write_i32_le(self.file);
        encoder.write_u32_le(self.data_pos);
        encoder.write_u32_le(self.undo_pos);
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_hash(&self.accumulator_checkpoint);
        encoder.write_bytes(&self.chain_work);
        encoder.write_i64_le(self.mint);
        encoder.write_i64_le(self.money_supply);
        match &self.stake {
            Some(stake) => {
                encoder.write_u8(1);
                encoder.write_hash(&stake.prevout.hash);
                encoder.write_u32_le(stake.prevout.index);
                encoder.write_u32_le(stake.time);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u64_le(self.stake_modifier);
        encoder.write_hash(&self.proof_of_stake_hash);
        encoder.write_varint(self.lottery_winners.len() as u64);
        for winner in &self.lottery_winners {
            encoder.write_hash(winner);
        }
        encoder.into_inner()
    }

    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let prev_hash = decoder.read_hash()?;
        let next_hash = decoder.read_hash()?;
        let height = decoder.read_varint()? as i32;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let file = decoder.read_i32_le()?;
        let data_pos = decoder.read_u32_le()?;
        let undo_pos = decoder.read_u32_le()?;
        let version = decoder.read_i32_le()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let accumulator_checkpoint = decoder.read_hash()?;
        let chain_work = decoder.read_fixed::<32>()?;
        let mint = decoder.read_i64_le()?;
        let money_supply = decoder.read_i64_le()?;
        let stake = match decoder.read_u8()? {
            0 => None,
            1 => {
                let stake_hash = decoder.read_hash()?;
                let stake_index = decoder.read_u32_le()?;
                let stake_time = decoder.read_u32_le()?;
                Some(BlockStake {
                    prevout: OutPoint::new(stake_hash, stake_index),
                    time: stake_time,
                })
            }
            _ => return Err(DecodeError::InvalidData("invalid stake marker")),
        };
        let stake_modifier = decoder.read_u64_le()?;
        let proof_of_stake_hash = decoder.read_hash()?;
        let winner_count = decoder.read_varint()? as usize;
        let mut lottery_winners = Vec::with_capacity(winner_count.min(64));
        for _ in 0..winner_count {
            lottery_winners.push(decoder.read_hash()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            prev_hash,
            next_hash,
            height,
            status,
            tx_count,
            file,
            data_pos,
            undo_pos,
            version,
            merkle_root,
            time,
            bits,
            nonce,
            accumulator_checkpoint,
            chain_work,
            mint,
            money_supply,
            stake,
            stake_modifier,
            proof_of_stake_hash,
            lottery_winners,
        })
    }

    fn apply_to(&self, entry: &mut BlockIndexEntry) {
        entry.height = self.height;
        entry.status = self.status;
        entry.tx_count = self.tx_count;
        entry.file = self.file;
        entry.data_pos = self.data_pos;
        entry.undo_pos = self.undo_pos;
        entry.version = self.version;
        entry.merkle_root = self.merkle_root;
        entry.time = self.time;
        entry.bits = self.bits;
        entry.nonce = self.nonce;
        entry.accumulator_checkpoint = self.accumulator_checkpoint;
        entry.chain_work = U256::from_little_endian(&self.chain_work);
        entry.mint = self.mint;
        entry.money_supply = self.money_supply;
        entry.stake = self.stake;
        entry.stake_modifier = self.stake_modifier;
        entry.proof_of_stake_hash = self.proof_of_stake_hash;
        entry.lottery_winners = self.lottery_winners.clone();
    }
}

#[derive(Debug)]
pub enum TreeDbError {
    Store(StoreError),
    Corrupt(&'static str),
    BadProofOfWork(Hash256),
    Interrupted,
}

impl std::fmt::Display for TreeDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeDbError::Store(err) => write!(f, "{err}"),
            TreeDbError::Corrupt(message) => write!(f, "{message}"),
            TreeDbError::BadProofOfWork(_) => write!(f, "stored header fails proof of work"),
            TreeDbError::Interrupted => write!(f, "block index load interrupted"),
        }
    }
}

impl std::error::Error for TreeDbError {}

impl From<StoreError> for TreeDbError {
    fn from(err: StoreError) -> Self {
        TreeDbError::Store(err)
    }
}

pub struct BlockTreeDb<S> {
    store: Arc<S>,
}

impl<S> BlockTreeDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: KeyValueStore> BlockTreeDb<S> {
    pub fn write_block_index(&self, batch: &mut WriteBatch, index: &DiskBlockIndex) {
        batch.put(Column::BlockIndex, index.hash, index.encode());
    }

    pub fn read_block_index(&self, hash: &Hash256) -> Result<Option<DiskBlockIndex>, StoreError> {
        let bytes = match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        DiskBlockIndex::decode(*hash, &bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    pub fn write_block_file_info(
        &self,
        batch: &mut WriteBatch,
        file: i32,
        info: &BlockFileInfo,
    ) {
        batch.put(Column::FileInfo, file_info_key(file), info.encode());
    }

    pub fn read_block_file_info(&self, file: i32) -> Result<Option<BlockFileInfo>, StoreError> {
        let bytes = match self.store.get(Column::FileInfo, &file_info_key(file))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        BlockFileInfo::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid block file info".to_string()))
            .map(Some)
    }

    pub fn write_last_block_file(&self, batch: &mut WriteBatch, file: i32) {
        batch.put(Column::FileInfo, LAST_FILE_KEY, file.to_le_bytes());
    }

    pub fn read_last_block_file(&self) -> Result<Option<i32>, StoreError> {
        let bytes = match self.store.get(Column::FileInfo, LAST_FILE_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid last file record".to_string()))?;
        Ok(Some(i32::from_le_bytes(raw)))
    }

    pub fn write_reindexing(&self, reindexing: bool) -> Result<(), StoreError> {
        if reindexing {
            self.store.put(Column::TreeMeta, REINDEX_KEY, b"1")
        } else {
            self.store.delete(Column::TreeMeta, REINDEX_KEY)
        }
    }

    pub fn read_reindexing(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::TreeMeta, REINDEX_KEY)?.is_some())
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), StoreError> {
        let key = named_key(FLAG_PREFIX, name);
        self.store
            .put(Column::TreeMeta, &key, if value { b"1" } else { b"0" })
    }

    pub fn read_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        let key = named_key(FLAG_PREFIX, name);
        Ok(self
            .store
            .get(Column::TreeMeta, &key)?
            .map(|bytes| bytes == b"1"))
    }

    pub fn write_int(&self, name: &str, value: i32) -> Result<(), StoreError> {
        let key = named_key(INT_PREFIX, name);
        self.store.put(Column::TreeMeta, &key, &value.to_le_bytes())
    }

    pub fn read_int(&self, name: &str) -> Result<Option<i32>, StoreError> {
        let key = named_key(INT_PREFIX, name);
        let bytes = match self.store.get(Column::TreeMeta, &key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid int record".to_string()))?;
        Ok(Some(i32::from_le_bytes(raw)))
    }

    /// Loads every stored header into `tree`. Parent links are wired in a
    /// second pass so record order is irrelevant; PoW-era headers are
    /// re-verified and the stake-seen set is rebuilt from PoS entries.
    pub fn load_block_tree(
        &self,
        tree: &mut BlockTree,
        params: &ChainParams,
        interrupt: &AtomicBool,
    ) -> Result<HashSet<(OutPoint, u32)>, TreeDbError> {
        let mut records = Vec::new();
        let mut interrupted = false;
        let walk = self
            .store
            .for_each_prefix(Column::BlockIndex, &[], &mut |key, value| {
                if interrupt.load(Ordering::Relaxed) {
                    interrupted = true;
                    return Err(StoreError::Backend("interrupted".to_string()));
                }
                let hash: Hash256 = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid block index key".to_string()))?;
                let record = DiskBlockIndex::decode(hash, value)
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                records.push(record);
                Ok(())
            });
        if let Err(err) = walk {
            if interrupted {
                return Err(TreeDbError::Interrupted);
            }
            return Err(TreeDbError::Store(err));
        }

        let mut stake_seen = HashSet::new();

        // First pass: create all entries.
        for record in &records {
            let idx = tree.insert(record.hash);
            record.apply_to(tree.entry_mut(idx));
        }

        // Second pass: wire parents now that every hash resolves.
        for record in &records {
            let idx = tree.lookup(&record.hash).expect("entry inserted above");
            let parent = if record.prev_hash == [0u8; 32] {
                None
            } else {
                match tree.lookup(&record.prev_hash) {
                    Some(parent) => Some(parent),
                    None => return Err(TreeDbError::Corrupt("block index parent missing")),
                }
            };
            tree.entry_mut(idx).parent = parent;

            if record.height <= params.last_pow_height
                && record.stake.is_none()
                && !check_proof_of_work(&record.hash, record.bits, params)
            {
                return Err(TreeDbError::BadProofOfWork(record.hash));
            }
            if let Some(stake) = record.stake {
                stake_seen.insert((stake.prevout, stake.time));
            }
        }

        // Skip pointers, lowest heights first so ancestors resolve.
        let mut by_height: Vec<usize> = records
            .iter()
            .map(|record| tree.lookup(&record.hash).expect("entry inserted above"))
            .collect();
        by_height.sort_by_key(|idx| tree.entry(*idx).height);
        for idx in by_height {
            let height = tree.entry(idx).height;
            let skip = if height > 0 {
                tree.ancestor(idx, crate::tree::skip_height(height))
            } else {
                None
            };
            tree.entry_mut(idx).skip = skip;
        }

        Ok(stake_seen)
    }
}

fn file_info_key(file: i32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = b'f';
    key[1..].copy_from_slice(&file.to_le_bytes());
    key
}

fn named_key(prefix: u8, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(prefix);
    key.extend_from_slice(name.as_bytes());
    key
}
