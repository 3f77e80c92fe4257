//! The block tree and the active chain.
//!
//! Every header ever received gets one arena entry; entries are never
//! destroyed during a run. Parent, skip and next links are arena indices,
//! so the tree owns all entries and cycles cannot leak.

use std::collections::HashMap;

use izzy_consensus::{Amount, Hash256};
use izzy_primitives::block::BlockHeader;
use izzy_primitives::outpoint::OutPoint;
use primitive_types::U256;

pub const STATUS_HEADER_VALID: u32 = 1 << 0;
pub const STATUS_HAVE_DATA: u32 = 1 << 1;
pub const STATUS_HAVE_UNDO: u32 = 1 << 2;
pub const STATUS_SCRIPTS_VALID: u32 = 1 << 3;
pub const STATUS_FAILED: u32 = 1 << 4;
pub const STATUS_FAILED_PARENT: u32 = 1 << 5;
pub const STATUS_IN_ACTIVE_CHAIN: u32 = 1 << 6;

const MTP_WINDOW: usize = 11;

/// Stake input recorded for a proof-of-stake block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockStake {
    pub prevout: OutPoint,
    pub time: u32,
}

#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub parent: Option<usize>,
    /// Forward link; meaningful only while on the active chain.
    pub next: Option<usize>,
    pub skip: Option<usize>,
    pub height: i32,

    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub accumulator_checkpoint: Hash256,

    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,

    pub status: u32,
    pub tx_count: u32,
    pub chain_work: U256,

    pub stake: Option<BlockStake>,
    pub stake_modifier: u64,
    pub proof_of_stake_hash: Hash256,
    pub mint: Amount,
    pub money_supply: Amount,
    pub lottery_winners: Vec<Hash256>,
}

impl BlockIndexEntry {
    pub fn unvalidated(hash: Hash256) -> Self {
        Self {
            hash,
            parent: None,
            next: None,
            skip: None,
            height: -1,
            version: 0,
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
            accumulator_checkpoint: [0u8; 32],
            file: -1,
            data_pos: 0,
            undo_pos: 0,
            status: 0,
            tx_count: 0,
            chain_work: U256::zero(),
            stake: None,
            stake_modifier: 0,
            proof_of_stake_hash: [0u8; 32],
            mint: 0,
            money_supply: 0,
            lottery_winners: Vec::new(),
        }
    }

    pub fn apply_header(&mut self, header: &BlockHeader) {
        self.version = header.version;
        self.merkle_root = header.merkle_root;
        self.time = header.time;
        self.bits = header.bits;
        self.nonce = header.nonce;
        self.accumulator_checkpoint = header.accumulator_checkpoint;
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.stake.is_some()
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        (self.status & flag) != 0
    }

    pub fn is_failed(&self) -> bool {
        self.has_flag(STATUS_FAILED) || self.has_flag(STATUS_FAILED_PARENT)
    }

    /// Eligible as part of the best chain: body on disk, nothing failed.
    pub fn is_connectable(&self) -> bool {
        self.has_flag(STATUS_HEADER_VALID) && self.has_flag(STATUS_HAVE_DATA) && !self.is_failed()
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height of the skip ancestor stored for a block at `height`.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Default)]
pub struct BlockTree {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, usize>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for `hash`, creating an unvalidated placeholder
    /// on first sight.
    pub fn insert(&mut self, hash: Hash256) -> usize {
        if let Some(&idx) = self.by_hash.get(&hash) {
            return idx;
        }
        let idx = self.entries.len();
        self.entries.push(BlockIndexEntry::unvalidated(hash));
        self.by_hash.insert(hash, idx);
        idx
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn entry(&self, idx: usize) -> &BlockIndexEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut BlockIndexEntry {
        &mut self.entries[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BlockIndexEntry)> {
        self.entries.iter().enumerate()
    }

    /// Links `idx` under `parent` and computes height and the skip
    /// pointer.
    pub fn link(&mut self, idx: usize, parent: Option<usize>) {
        let height = match parent {
            Some(parent_idx) => self.entries[parent_idx].height + 1,
            None => 0,
        };
        self.entries[idx].parent = parent;
        self.entries[idx].height = height;
        let skip = if parent.is_some() {
            self.ancestor(idx, skip_height(height))
        } else {
            None
        };
        self.entries[idx].skip = skip;
    }

    /// O(log n) ancestor lookup over the skip pointers.
    pub fn ancestor(&self, idx: usize, height: i32) -> Option<usize> {
        let mut current = idx;
        let mut current_height = self.entries[current].height;
        if height > current_height || height < 0 {
            return None;
        }
        while current_height > height {
            let entry = &self.entries[current];
            let step_skip = skip_height(current_height);
            match entry.skip {
                Some(skip) if step_skip >= height => {
                    current = skip;
                    current_height = step_skip;
                }
                _ => {
                    current = entry.parent?;
                    current_height -= 1;
                }
            }
        }
        Some(current)
    }

    /// Median of the previous 11 block times, the block itself included.
    pub fn median_time_past(&self, idx: usize) -> i64 {
        let mut times = Vec::with_capacity(MTP_WINDOW);
        let mut current = Some(idx);
        while let Some(entry_idx) = current {
            if times.len() == MTP_WINDOW {
                break;
            }
            let entry = &self.entries[entry_idx];
            times.push(entry.time as i64);
            current = entry.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Last common ancestor of two entries.
    pub fn last_common_ancestor(&self, a: usize, b: usize) -> Option<usize> {
        let height = self.entries[a].height.min(self.entries[b].height);
        let mut left = self.ancestor(a, height)?;
        let mut right = self.ancestor(b, height)?;
        while left != right {
            left = self.entries[left].parent?;
            right = self.entries[right].parent?;
        }
        Some(left)
    }
}

/// The active chain, indexable by height in O(1).
#[derive(Default)]
pub struct ActiveChain {
    chain: Vec<usize>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn tip(&self) -> Option<usize> {
        self.chain.last().copied()
    }

    pub fn at(&self, height: i32) -> Option<usize> {
        if height < 0 {
            return None;
        }
        self.chain.get(height as usize).copied()
    }

    pub fn contains(&self, tree: &BlockTree, idx: usize) -> bool {
        self.at(tree.entry(idx).height) == Some(idx)
    }

    /// Appends `idx`, which must extend the current tip.
    pub fn push(&mut self, tree: &mut BlockTree, idx: usize) {
        debug_assert_eq!(tree.entry(idx).parent, self.tip());
        if let Some(tip) = self.tip() {
            tree.entry_mut(tip).next = Some(idx);
        }
        tree.entry_mut(idx).status |= STATUS_IN_ACTIVE_CHAIN;
        tree.entry_mut(idx).next = None;
        self.chain.push(idx);
    }

    /// Removes the tip.
    pub fn pop(&mut self, tree: &mut BlockTree) -> Option<usize> {
        let idx = self.chain.pop()?;
        tree.entry_mut(idx).status &= !STATUS_IN_ACTIVE_CHAIN;
        tree.entry_mut(idx).next = None;
        if let Some(tip) = self.tip() {
            tree.entry_mut(tip).next = None;
        }
        Some(idx)
    }

    /// Rebuilds the chain to end at `tip_idx`. The forward links of the
    /// entries are recomputed here and never trusted from disk.
    pub fn set_tip(&mut self, tree: &mut BlockTree, tip_idx: usize) {
        for &idx in &self.chain {
            tree.entry_mut(idx).status &= !STATUS_IN_ACTIVE_CHAIN;
            tree.entry_mut(idx).next = None;
        }
        self.chain.clear();

        let height = tree.entry(tip_idx).height;
        self.chain.resize((height + 1) as usize, usize::MAX);
        let mut current = Some(tip_idx);
        while let Some(idx) = current {
            let entry_height = tree.entry(idx).height;
            self.chain[entry_height as usize] = idx;
            current = tree.entry(idx).parent;
        }
        let mut previous: Option<usize> = None;
        for &idx in &self.chain {
            debug_assert_ne!(idx, usize::MAX);
            let entry = tree.entry_mut(idx);
            entry.status |= STATUS_IN_ACTIVE_CHAIN;
            entry.next = None;
            if let Some(prev) = previous {
                tree.entry_mut(prev).next = Some(idx);
            }
            previous = Some(idx);
        }
    }

    /// Sparse, exponentially spaced ancestor hashes starting at `from`.
    pub fn locator(&self, tree: &BlockTree, from: Option<usize>) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1i32;
        let mut current = match from.or_else(|| self.tip()) {
            Some(idx) => idx,
            None => return hashes,
        };

        loop {
            hashes.push(tree.entry(current).hash);
            let height = tree.entry(current).height;
            if height == 0 {
                break;
            }
            let next_height = (height - step).max(0);
            current = if self.contains(tree, current) {
                // Use the O(1) chain index while we are on the active
                // chain.
                match self.at(next_height) {
                    Some(idx) => idx,
                    None => break,
                }
            } else {
                match tree.ancestor(current, next_height) {
                    Some(idx) => idx,
                    None => break,
                }
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }

    /// First locator entry that lies on the active chain.
    pub fn find_fork(&self, tree: &BlockTree, locator: &[Hash256]) -> Option<usize> {
        for hash in locator {
            if let Some(idx) = tree.lookup(hash) {
                if self.contains(tree, idx) {
                    return Some(idx);
                }
            }
        }
        None
    }
}
