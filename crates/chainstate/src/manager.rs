//! Chain state orchestration: accepting blocks, activating the best
//! chain, reorganisation, flushing and invalidation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use izzy_consensus::subsidy::{block_payees, is_lottery_height};
use izzy_consensus::{ChainParams, DeploymentPos, Hash256};
use izzy_pow::{next_work_required, work_from_bits, WindowEntry};
use izzy_primitives::block::Block;
use izzy_primitives::encoding::{decode, encode};
use izzy_primitives::genesis::{checked_genesis_block, GenesisError};
use izzy_primitives::hash::{hash256_to_hex, sha256d};
use izzy_primitives::outpoint::OutPoint;
use izzy_primitives::script::address_key;
use izzy_primitives::transaction::{Transaction, TxOut};
use izzy_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::addressindex::{AddressIndex, AddressIndexKey, AddressUnspentKey, AddressUnspentValue};
use crate::blockfiles::{BlockFiles, DiskPos};
use crate::coins::{Coins, CoinsCache, CoinsView};
use crate::coinsdb::{coin_stats, CoinStats, CoinStatsError, CoinsDb};
use crate::spentindex::{SpentIndex, SpentIndexValue};
use crate::treedb::{BlockFileInfo, BlockTreeDb, DiskBlockIndex, TreeDbError};
use crate::tree::{
    ActiveChain, BlockIndexEntry, BlockStake, BlockTree, STATUS_FAILED, STATUS_FAILED_PARENT,
    STATUS_HAVE_DATA, STATUS_HAVE_UNDO, STATUS_HEADER_VALID, STATUS_SCRIPTS_VALID,
};
use crate::txindex::{TxDiskPos, TxIndex};
use crate::undo::{BlockUndo, CoinMetaUndo, SpentCoinUndo, TxUndo};
use crate::validation::{
    check_block, check_coinbase_height, check_payment_outputs, check_stake_age,
    check_stake_kernel, check_version_bits, is_final_tx, next_stake_modifier,
    proof_of_stake_hash, run_script_checks, ScriptCheck, SignatureChecker,
    StructuralSignatureChecker, ValidationError,
};
use crate::versionbits::{ThresholdState, VersionBitsCache};

const LOTTERY_WINNER_COUNT: usize = 11;
const IBD_TIP_AGE: i64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    IfNeeded,
    Periodic,
    Always,
}

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    /// High-water mark for the main coins cache.
    pub coins_cache_bytes: usize,
    pub periodic_flush_interval: Duration,
    /// Maintain the address and spent indexes.
    pub extra_indexes: bool,
    /// Verify the coin commitment against the tip on startup.
    pub consistency_checks: bool,
}

impl ChainStateConfig {
    pub fn for_params(params: &ChainParams) -> Self {
        Self {
            coins_cache_bytes: 32 * 1024 * 1024,
            periodic_flush_interval: Duration::from_secs(600),
            extra_indexes: true,
            consistency_checks: params.default_consistency_checks,
        }
    }
}

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    Genesis(GenesisError),
    TreeDb(TreeDbError),
    Corrupt(&'static str),
    /// Fatal local failure: the node must shut down.
    Abort(&'static str),
    Interrupted,
    UnknownBlock,
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Genesis(err) => write!(f, "{err}"),
            ChainStateError::TreeDb(err) => write!(f, "{err}"),
            ChainStateError::Corrupt(message) => write!(f, "{message}"),
            ChainStateError::Abort(message) => write!(f, "aborting: {message}"),
            ChainStateError::Interrupted => write!(f, "interrupted"),
            ChainStateError::UnknownBlock => write!(f, "unknown block"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<GenesisError> for ChainStateError {
    fn from(err: GenesisError) -> Self {
        ChainStateError::Genesis(err)
    }
}

impl From<TreeDbError> for ChainStateError {
    fn from(err: TreeDbError) -> Self {
        ChainStateError::TreeDb(err)
    }
}

impl ChainStateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainStateError::Validation(err) if err.is_transient())
    }
}

struct ChainInner<S: KeyValueStore> {
    tree: BlockTree,
    chain: ActiveChain,
    coins: CoinsCache<CoinsDb<S>>,
    stake_seen: HashSet<(OutPoint, u32)>,
}

/// Everything the chain-state subsystem owns, threaded explicitly
/// instead of process globals. Construction order: params, stores,
/// caches, manager.
pub struct ChainState<S: KeyValueStore, F: BlockFiles> {
    params: ChainParams,
    config: ChainStateConfig,
    tree_db: BlockTreeDb<S>,
    tx_index: TxIndex<Arc<S>>,
    address_index: AddressIndex<Arc<S>>,
    spent_index: SpentIndex<Arc<S>>,
    block_files: F,
    coin_store: Arc<S>,
    inner: Mutex<ChainInner<S>>,
    versionbits: VersionBitsCache,
    checker: Box<dyn SignatureChecker>,
    interrupt: Arc<AtomicBool>,
    abort_requested: AtomicBool,
    last_flush: Mutex<Instant>,
}

/// Result of connecting one block; applied only when the whole block
/// passed.
struct ConnectOutcome {
    undo: BlockUndo,
    fees: i64,
    mint: i64,
    tree_batch: WriteBatch,
    lottery_winners: Vec<Hash256>,
}

impl<S: KeyValueStore, F: BlockFiles> ChainState<S, F> {
    pub fn new(
        params: ChainParams,
        tree_store: Arc<S>,
        coin_store: Arc<S>,
        block_files: F,
        config: ChainStateConfig,
    ) -> Result<Self, ChainStateError> {
        // The rebuilt genesis must hash to the compiled-in constants; a
        // mismatch means the binary and its parameters disagree.
        let genesis = checked_genesis_block(&params)?;

        let tree_db = BlockTreeDb::new(Arc::clone(&tree_store));
        let tx_index = TxIndex::new(Arc::clone(&tree_store));
        let address_index = AddressIndex::new(Arc::clone(&tree_store));
        let spent_index = SpentIndex::new(Arc::clone(&tree_store));
        let interrupt = Arc::new(AtomicBool::new(false));

        let mut tree = BlockTree::new();
        let stake_seen = tree_db.load_block_tree(&mut tree, &params, &interrupt)?;

        let coins = CoinsCache::new(CoinsDb::new(Arc::clone(&coin_store)));

        let state = Self {
            params,
            config,
            tree_db,
            tx_index,
            address_index,
            spent_index,
            block_files,
            coin_store,
            inner: Mutex::new(ChainInner {
                tree,
                chain: ActiveChain::new(),
                coins,
                stake_seen,
            }),
            versionbits: VersionBitsCache::new(),
            checker: Box::new(StructuralSignatureChecker),
            interrupt,
            abort_requested: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
        };

        {
            let mut inner = state.inner.lock().expect("validation lock");
            if inner.tree.is_empty() {
                state.init_genesis(&mut inner, &genesis)?;
            } else {
                state.restore_tip(&mut inner)?;
            }
        }
        state.activate_best_chain(FlushMode::IfNeeded)?;

        if state.config.consistency_checks {
            state.verify_coin_commitment()?;
        }
        Ok(state)
    }

    /// Cooperative cancellation flag polled by long loops.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Fatal-local path: requests shutdown; safe to call while holding
    /// the validation lock.
    pub fn abort_node(&self, message: &'static str) -> ChainStateError {
        izzy_log::log_error!("{message}");
        self.abort_requested.store(true, Ordering::Relaxed);
        self.interrupt.store(true, Ordering::Relaxed);
        ChainStateError::Abort(message)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Relaxed)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn init_genesis(
        &self,
        inner: &mut ChainInner<S>,
        genesis: &Block,
    ) -> Result<(), ChainStateError> {
        let hash = genesis.hash();
        izzy_log::log_info!(
            "initializing block index with genesis {}",
            hash256_to_hex(&hash)
        );

        let bytes = encode(genesis);
        let pos = self.block_files.append_block(&bytes)?;

        let idx = inner.tree.insert(hash);
        inner.tree.link(idx, None);
        let entry = inner.tree.entry_mut(idx);
        entry.apply_header(&genesis.header);
        entry.status |= STATUS_HEADER_VALID | STATUS_HAVE_DATA | STATUS_SCRIPTS_VALID;
        entry.tx_count = genesis.transactions.len() as u32;
        entry.file = pos.file;
        entry.data_pos = pos.pos;
        entry.chain_work = work_from_bits(genesis.header.bits)
            .map_err(|_| ChainStateError::Corrupt("genesis difficulty invalid"))?;
        // The genesis coinbase is unspendable and never enters the coin
        // set, so the recorded supply starts at zero.
        entry.mint = 0;
        entry.money_supply = 0;

        inner.chain.push(&mut inner.tree, idx);

        let mut batch = WriteBatch::new();
        self.write_index_entry(&inner.tree, idx, &mut batch);
        let mut info = BlockFileInfo::default();
        info.add_block(0, genesis.header.time);
        info.size = bytes.len() as u32;
        self.tree_db
            .write_block_file_info(&mut batch, pos.file, &info);
        self.tree_db.write_last_block_file(&mut batch, pos.file);
        self.tree_db.store().write_batch(&batch)?;

        inner.coins.set_best_block(hash);
        inner
            .coins
            .flush()
            .map_err(|_| self.abort_node("failed to write genesis chainstate"))?;
        Ok(())
    }

    fn restore_tip(&self, inner: &mut ChainInner<S>) -> Result<(), ChainStateError> {
        let best = inner
            .coins
            .best_block()?
            .ok_or(ChainStateError::Corrupt("coin database has no best block"))?;
        let tip_idx = inner
            .tree
            .lookup(&best)
            .ok_or(ChainStateError::Corrupt("best block missing from index"))?;
        inner.chain.set_tip(&mut inner.tree, tip_idx);

        // The loaded stake-seen set covers every stored PoS header; trim
        // it to the standing chain so replaying blocks the coin database
        // has not caught up with does not trip the duplicate-kernel
        // check.
        let mut standing = HashSet::new();
        for height in 0..=inner.chain.height() {
            if let Some(idx) = inner.chain.at(height) {
                if let Some(stake) = inner.tree.entry(idx).stake {
                    standing.insert((stake.prevout, stake.time));
                }
            }
        }
        inner.stake_seen = standing;

        izzy_log::log_info!(
            "restored tip {} at height {}",
            hash256_to_hex(&best),
            inner.tree.entry(tip_idx).height
        );
        Ok(())
    }

    fn verify_coin_commitment(&self) -> Result<(), ChainStateError> {
        let inner = self.inner.lock().expect("validation lock");
        let db = CoinsDb::new(Arc::clone(&self.coin_store));
        let stats = match coin_stats(&db, &self.interrupt) {
            Ok(stats) => stats,
            Err(CoinStatsError::Interrupted) => return Err(ChainStateError::Interrupted),
            Err(CoinStatsError::Store(err)) => return Err(ChainStateError::Store(err)),
        };
        if let Some(tip_idx) = inner.chain.tip() {
            let tip = inner.tree.entry(tip_idx);
            if stats.best_block == Some(tip.hash) && stats.total_amount != tip.money_supply {
                return Err(ChainStateError::Corrupt(
                    "coin totals disagree with recorded money supply",
                ));
            }
        }
        Ok(())
    }

    /// Full acceptance path: context-independent check, header
    /// acceptance, contextual checks, body write, then activation.
    pub fn accept_block(&self, block: &Block) -> Result<Hash256, ChainStateError> {
        let hash = block.hash();
        {
            let mut inner = self.inner.lock().expect("validation lock");

            if let Some(idx) = inner.tree.lookup(&hash) {
                let entry = inner.tree.entry(idx);
                if entry.is_failed() {
                    return Err(ValidationError::Consensus("block known invalid").into());
                }
                if entry.has_flag(STATUS_HAVE_DATA) {
                    return Ok(hash);
                }
            }

            check_block(block, &self.params)?;
            let idx = self.accept_header(&mut inner, block)?;
            if let Err(err) = self.contextual_check_block(&inner, idx, block) {
                if !err.is_transient() {
                    self.mark_failed(&mut inner, idx)?;
                }
                return Err(err);
            }

            // Hand the body to the external writer and remember where it
            // landed.
            let bytes = encode(block);
            let pos = self.block_files.append_block(&bytes)?;
            let entry = inner.tree.entry_mut(idx);
            entry.file = pos.file;
            entry.data_pos = pos.pos;
            entry.tx_count = block.transactions.len() as u32;
            entry.status |= STATUS_HAVE_DATA;

            let mut batch = WriteBatch::new();
            self.write_index_entry(&inner.tree, idx, &mut batch);
            let mut info = self
                .tree_db
                .read_block_file_info(pos.file)?
                .unwrap_or_default();
            info.add_block(inner.tree.entry(idx).height as u32, block.header.time);
            info.size += bytes.len() as u32;
            self.tree_db
                .write_block_file_info(&mut batch, pos.file, &info);
            self.tree_db.write_last_block_file(&mut batch, pos.file);
            self.tree_db.store().write_batch(&batch)?;
        }

        let failures = self.activate_best_chain(FlushMode::IfNeeded)?;
        if let Some((_, err)) = failures.iter().find(|(failed, _)| *failed == hash) {
            return Err((*err).into());
        }
        Ok(hash)
    }

    /// Header-context checks and index insertion.
    fn accept_header(
        &self,
        inner: &mut ChainInner<S>,
        block: &Block,
    ) -> Result<usize, ChainStateError> {
        let header = &block.header;
        let hash = header.hash();

        let parent_idx = inner
            .tree
            .lookup(&header.prev_block)
            .ok_or(ValidationError::Transient("previous block unknown"))?;
        let parent = inner.tree.entry(parent_idx);
        if !parent.has_flag(STATUS_HEADER_VALID) {
            return Err(ValidationError::Transient("previous header not validated").into());
        }
        let height = parent.height + 1;

        if parent.is_failed() {
            let idx = inner.tree.insert(hash);
            inner.tree.link(idx, Some(parent_idx));
            inner.tree.entry_mut(idx).apply_header(header);
            inner.tree.entry_mut(idx).status |= STATUS_FAILED_PARENT;
            let mut batch = WriteBatch::new();
            self.write_index_entry(&inner.tree, idx, &mut batch);
            self.tree_db.store().write_batch(&batch)?;
            return Err(ValidationError::Consensus("previous block invalid").into());
        }

        // Hard checkpoints pin specific heights.
        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if checkpoint.hash != hash {
                return Err(ValidationError::Consensus("checkpoint mismatch").into());
            }
        }

        if (header.time as i64) <= inner.tree.median_time_past(parent_idx) {
            return Err(ValidationError::Consensus("block time too old").into());
        }

        let expected_bits = self.expected_bits(&inner.tree, parent_idx, header.time)?;
        if header.bits != expected_bits {
            return Err(ValidationError::Consensus("incorrect difficulty").into());
        }

        let posv2 = self.params.deployment(DeploymentPos::PosV2);
        let posv2_active = self.versionbits.state(
            &inner.tree,
            Some(parent_idx),
            posv2,
            DeploymentPos::PosV2,
        ) == ThresholdState::Active;
        check_version_bits(header.version, posv2_active)?;

        // Phase split: PoW ends at the configured height, stake begins
        // right after.
        let proof_of_stake = block.is_proof_of_stake();
        if height <= self.params.last_pow_height && proof_of_stake {
            return Err(ValidationError::Consensus("premature proof of stake").into());
        }
        if height > self.params.last_pow_height && !proof_of_stake {
            return Err(ValidationError::Consensus("proof of work exhausted").into());
        }

        let stake = if proof_of_stake {
            let coinstake = &block.transactions[1];
            let kernel = BlockStake {
                prevout: coinstake.vin[0].prevout,
                time: header.time,
            };
            // Reject reuse of a kernel another standing block consumed.
            if inner.stake_seen.contains(&(kernel.prevout, kernel.time)) {
                return Err(ValidationError::Consensus("duplicate proof of stake").into());
            }
            Some(kernel)
        } else {
            None
        };

        let parent = inner.tree.entry(parent_idx);
        let parent_work = parent.chain_work;
        let parent_modifier = parent.stake_modifier;

        let work = work_from_bits(header.bits)
            .map_err(|_| ValidationError::Consensus("invalid difficulty encoding"))?;
        let idx = inner.tree.insert(hash);
        inner.tree.link(idx, Some(parent_idx));
        let entry = inner.tree.entry_mut(idx);
        entry.apply_header(header);
        entry.status |= STATUS_HEADER_VALID;
        entry.chain_work = parent_work + work;
        entry.stake = stake;
        entry.stake_modifier = next_stake_modifier(parent_modifier, &hash);
        if let Some(kernel) = stake {
            entry.proof_of_stake_hash =
                proof_of_stake_hash(parent_modifier, &kernel.prevout, kernel.time);
        }
        Ok(idx)
    }

    /// Chain-context block rules that need no coin data.
    fn contextual_check_block(
        &self,
        inner: &ChainInner<S>,
        idx: usize,
        block: &Block,
    ) -> Result<(), ChainStateError> {
        let entry = inner.tree.entry(idx);
        let height = entry.height;
        let parent_idx = entry
            .parent
            .ok_or(ChainStateError::Corrupt("missing parent"))?;
        let cutoff = inner.tree.median_time_past(parent_idx);

        check_coinbase_height(block, height)?;

        for tx in &block.transactions {
            if !is_final_tx(tx, height, cutoff) {
                return Err(ValidationError::Consensus("non-final transaction").into());
            }
        }

        let payees = block_payees(height, &self.params);
        let reward_tx = if block.is_proof_of_stake() {
            &block.transactions[1]
        } else {
            &block.transactions[0]
        };
        check_payment_outputs(reward_tx, &payees)?;
        Ok(())
    }

    fn expected_bits(
        &self,
        tree: &BlockTree,
        parent_idx: usize,
        next_time: u32,
    ) -> Result<u32, ChainStateError> {
        let parent = tree.entry(parent_idx);
        let next_height = (parent.height + 1) as i64;
        let pos_phase = next_height > self.params.last_pow_height as i64;
        let interval = if pos_phase {
            self.params.pos_retarget_interval()
        } else {
            self.params.pow_retarget_interval()
        }
        .max(1);

        let len = (parent.height as i64 + 1).min(interval);
        let mut window = Vec::with_capacity(len as usize);
        let mut walker = Some(parent_idx);
        for _ in 0..len {
            let idx = match walker {
                Some(idx) => idx,
                None => break,
            };
            let entry = tree.entry(idx);
            window.push(WindowEntry {
                height: entry.height as i64,
                time: entry.time as i64,
                bits: entry.bits,
            });
            walker = entry.parent;
        }
        window.reverse();

        next_work_required(&window, &self.params, Some(next_time as i64))
            .map_err(|_| ChainStateError::Corrupt("difficulty window unavailable"))
    }

    /// Steps the active chain toward the best connectable candidate,
    /// disconnecting and connecting as needed. Returns the blocks that
    /// failed consensus checks along the way.
    pub fn activate_best_chain(
        &self,
        mode: FlushMode,
    ) -> Result<Vec<(Hash256, ValidationError)>, ChainStateError> {
        let mut failures = Vec::new();
        let mut skip: HashSet<usize> = HashSet::new();
        let mut inner = self.inner.lock().expect("validation lock");

        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                return Err(ChainStateError::Interrupted);
            }

            let tip = inner.chain.tip();
            let candidate = match self.best_candidate(&inner, tip, &skip) {
                Some(candidate) => candidate,
                None => break,
            };

            let fork = match tip {
                Some(tip_idx) => inner
                    .tree
                    .last_common_ancestor(tip_idx, candidate)
                    .ok_or(ChainStateError::Corrupt("disconnected block tree"))?,
                None => candidate,
            };

            // Disconnect back to the fork point.
            while let Some(tip_idx) = inner.chain.tip() {
                if tip_idx == fork {
                    break;
                }
                self.disconnect_tip(&mut inner)?;
            }

            // Connect up the candidate branch.
            let mut path = Vec::new();
            let mut walker = candidate;
            while walker != fork {
                path.push(walker);
                walker = match inner.tree.entry(walker).parent {
                    Some(parent) => parent,
                    None => break,
                };
            }
            path.reverse();

            let mut retry = false;
            for idx in path {
                match self.connect_tip(&mut inner, idx) {
                    Ok(()) => {}
                    Err(ChainStateError::Validation(err)) if !err.is_transient() => {
                        let hash = inner.tree.entry(idx).hash;
                        izzy_log::log_warn!("invalid block {}: {}", hash256_to_hex(&hash), err);
                        failures.push((hash, err));
                        self.mark_failed(&mut inner, idx)?;
                        retry = true;
                        break;
                    }
                    Err(ChainStateError::Validation(err)) => {
                        // Transient: leave nothing marked, try the next
                        // candidate this round.
                        izzy_log::log_debug!(
                            "postponing block {}: {}",
                            hash256_to_hex(&inner.tree.entry(idx).hash),
                            err
                        );
                        skip.insert(candidate);
                        retry = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            self.flush_locked(&mut inner, mode)?;
            if !retry {
                break;
            }
        }

        self.flush_locked(&mut inner, mode)?;
        Ok(failures)
    }

    /// Most-work connectable entry whose branch is fully available.
    /// `None` when the current tip is already best.
    fn best_candidate(
        &self,
        inner: &ChainInner<S>,
        tip: Option<usize>,
        skip: &HashSet<usize>,
    ) -> Option<usize> {
        let tip_work = tip.map(|idx| inner.tree.entry(idx).chain_work);
        let mut best: Option<usize> = None;
        for (idx, entry) in inner.tree.iter() {
            if Some(idx) == tip || skip.contains(&idx) || !entry.is_connectable() {
                continue;
            }
            if let Some(tip_work) = tip_work {
                if entry.chain_work <= tip_work {
                    continue;
                }
            }
            if let Some(best_idx) = best {
                if entry.chain_work <= inner.tree.entry(best_idx).chain_work {
                    continue;
                }
            }
            if !self.branch_available(inner, tip, idx) {
                continue;
            }
            best = Some(idx);
        }
        best
    }

    /// The whole branch from the fork point up to `idx` has block data
    /// and no failures.
    fn branch_available(&self, inner: &ChainInner<S>, tip: Option<usize>, idx: usize) -> bool {
        let fork = match tip {
            Some(tip_idx) => inner.tree.last_common_ancestor(tip_idx, idx),
            None => None,
        };
        let mut walker = Some(idx);
        while let Some(current) = walker {
            if Some(current) == fork {
                return true;
            }
            let entry = inner.tree.entry(current);
            if !entry.is_connectable() {
                return false;
            }
            walker = entry.parent;
        }
        fork.is_none()
    }

    fn read_block(&self, entry: &BlockIndexEntry) -> Result<Block, ChainStateError> {
        let bytes = self
            .block_files
            .read_block(DiskPos::new(entry.file, entry.data_pos))?;
        decode::<Block>(&bytes).map_err(|_| ChainStateError::Corrupt("stored block undecodable"))
    }

    /// Applies `idx` on top of the current tip through a transient
    /// overlay; only a fully valid block reaches the main cache.
    fn connect_tip(&self, inner: &mut ChainInner<S>, idx: usize) -> Result<(), ChainStateError> {
        let block = self.read_block(inner.tree.entry(idx))?;
        let hash = inner.tree.entry(idx).hash;

        let outcome = {
            let ChainInner {
                tree,
                chain: _,
                coins,
                stake_seen,
            } = &mut *inner;
            let mut overlay = CoinsCache::new(&mut *coins);
            match self.connect_block(tree, stake_seen, idx, &block, &mut overlay) {
                Ok(outcome) => {
                    overlay.set_best_block(hash);
                    overlay.flush()?;
                    outcome
                }
                // Dropping the overlay discards every speculative coin
                // mutation; the parent cache stays untouched.
                Err(err) => return Err(err),
            }
        };

        // Undo data goes to the external writer; its position rides
        // along in the index entry.
        let undo_bytes = encode(&outcome.undo);
        let undo_pos = self.block_files.append_undo(&undo_bytes)?;

        if let Some(stake) = inner.tree.entry(idx).stake {
            inner.stake_seen.insert((stake.prevout, stake.time));
        }

        let parent_supply = inner
            .tree
            .entry(idx)
            .parent
            .map_or(0, |parent| inner.tree.entry(parent).money_supply);
        let entry = inner.tree.entry_mut(idx);
        entry.status |= STATUS_SCRIPTS_VALID | STATUS_HAVE_UNDO;
        entry.undo_pos = undo_pos.pos;
        entry.mint = outcome.mint;
        entry.money_supply = parent_supply + outcome.mint;
        entry.lottery_winners = outcome.lottery_winners;

        inner.chain.push(&mut inner.tree, idx);
        inner.coins.set_best_block(hash);

        let mut batch = outcome.tree_batch;
        self.write_index_entry(&inner.tree, idx, &mut batch);
        self.tree_db.store().write_batch(&batch)?;

        izzy_log::log_debug!(
            "connected {} at height {} (fees {})",
            hash256_to_hex(&hash),
            inner.tree.entry(idx).height,
            outcome.fees
        );
        Ok(())
    }

    /// Applies a block's transactions to `view`: spend inputs, collect
    /// fees, enforce the payout schedule, create outputs, and queue the
    /// extra-index updates.
    fn connect_block<V: CoinsView>(
        &self,
        tree: &BlockTree,
        stake_seen: &HashSet<(OutPoint, u32)>,
        idx: usize,
        block: &Block,
        view: &mut CoinsCache<V>,
    ) -> Result<ConnectOutcome, ChainStateError> {
        let entry = tree.entry(idx);
        let height = entry.height;
        let proof_of_stake = block.is_proof_of_stake();

        if let Some(kernel) = entry.stake {
            // The kernel must not have been consumed by a block that is
            // still standing.
            if stake_seen.contains(&(kernel.prevout, kernel.time)) {
                return Err(ValidationError::Consensus("duplicate proof of stake").into());
            }
        }

        let mut undo = BlockUndo::default();
        let mut tree_batch = WriteBatch::new();
        let mut script_checks: Vec<ScriptCheck> = Vec::new();
        let offsets = crate::validation::transaction_offsets(block);
        let block_pos = DiskPos::new(entry.file, entry.data_pos);

        let mut fees: i64 = 0;
        let mut stake_in_out: Option<(i64, i64)> = None;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            let is_coinbase = tx_index == 0;

            if !is_coinbase {
                let mut tx_undo = TxUndo::default();
                let mut value_in: i64 = 0;
                for (input_index, input) in tx.vin.iter().enumerate() {
                    let spent = view
                        .spend_output(&input.prevout.hash, input.prevout.index)?
                        .ok_or(ValidationError::Transient("input missing or spent"))?;

                    if (spent.coinbase || spent.coinstake)
                        && height - spent.height < self.params.maturity
                    {
                        return Err(
                            ValidationError::Consensus("premature spend of coinbase").into()
                        );
                    }

                    // Stake kernel rules bind to the coinstake's first
                    // input.
                    if proof_of_stake && tx_index == 1 && input_index == 0 {
                        let kernel = entry.stake.ok_or(ChainStateError::Corrupt(
                            "stake block without kernel record",
                        ))?;
                        let stake_block_time = tree
                            .ancestor(idx, spent.height)
                            .map(|stake_idx| tree.entry(stake_idx).time)
                            .ok_or(ValidationError::Transient("stake coin height unknown"))?;
                        check_stake_age(stake_block_time, kernel.time, &self.params)?;
                        check_stake_kernel(
                            &entry.proof_of_stake_hash,
                            entry.bits,
                            spent.output.value,
                        )?;
                    }

                    script_checks.push(ScriptCheck {
                        tx_index,
                        input_index,
                        script_sig: input.script_sig.clone(),
                        script_pubkey: spent.output.script_pubkey.clone(),
                        value: spent.output.value,
                    });

                    value_in = value_in
                        .checked_add(spent.output.value)
                        .ok_or(ValidationError::Consensus("input value overflow"))?;

                    if self.config.extra_indexes {
                        self.index_spend(
                            &mut tree_batch,
                            &input.prevout,
                            &spent.output,
                            txid,
                            input_index as u32,
                            height,
                            tx_index as u32,
                        );
                    }

                    tx_undo.spent.push(SpentCoinUndo {
                        output: spent.output,
                        meta: spent.pruned.then_some(CoinMetaUndo {
                            version: spent.version,
                            coinbase: spent.coinbase,
                            coinstake: spent.coinstake,
                            height: spent.height,
                        }),
                    });
                }

                let value_out = tx.value_out();
                if tx.is_coinstake() {
                    // The coinstake's surplus is the block reward; it is
                    // checked against the schedule below.
                    stake_in_out = Some((value_in, value_out));
                } else {
                    if value_out > value_in {
                        return Err(ValidationError::Consensus("inputs below outputs").into());
                    }
                    fees = fees
                        .checked_add(value_in - value_out)
                        .ok_or(ValidationError::Consensus("fee overflow"))?;
                }
                undo.txs.push(tx_undo);
            }

            view.add_tx_coins(txid, Coins::from_tx(tx, height))?;

            if self.config.extra_indexes {
                self.index_outputs(&mut tree_batch, tx, txid, height, tx_index as u32);
            }
            self.tx_index.put(
                &mut tree_batch,
                &txid,
                &tx.bare_txid(),
                TxDiskPos {
                    block: block_pos,
                    offset: offsets[tx_index],
                },
            );
        }

        // Reward equation: the producer claims exactly the schedule plus
        // collected fees.
        let payees = block_payees(height, &self.params);
        let expected = payees
            .total()
            .checked_add(fees)
            .ok_or(ValidationError::Consensus("reward overflow"))?;
        if proof_of_stake {
            let (stake_in, stake_out) =
                stake_in_out.ok_or(ChainStateError::Corrupt("missing coinstake"))?;
            if stake_out - stake_in != expected {
                return Err(ValidationError::Consensus("bad coinstake reward").into());
            }
        } else {
            if block.transactions[0].value_out() != expected {
                return Err(ValidationError::Consensus("bad coinbase amount").into());
            }
        }

        run_script_checks(&script_checks, self.checker.as_ref())?;

        let lottery_winners = self.next_lottery_winners(tree, idx, block, height);

        Ok(ConnectOutcome {
            undo,
            fees,
            mint: payees.total(),
            tree_batch,
            lottery_winners,
        })
    }

    /// Winner list for the lottery cycle containing `height`: the best
    /// scoring reward transactions since the cycle started.
    fn next_lottery_winners(
        &self,
        tree: &BlockTree,
        idx: usize,
        block: &Block,
        height: i32,
    ) -> Vec<Hash256> {
        if height < self.params.lottery_start_height {
            return Vec::new();
        }
        let reward_txid = if block.is_proof_of_stake() {
            block.transactions[1].txid()
        } else {
            block.transactions[0].txid()
        };

        let mut winners = if is_lottery_height(height, &self.params) {
            // A payout block starts the next cycle fresh.
            Vec::new()
        } else {
            tree.entry(idx)
                .parent
                .map(|parent| tree.entry(parent).lottery_winners.clone())
                .unwrap_or_default()
        };
        winners.push(reward_txid);
        winners.sort_by_key(|txid| sha256d(txid));
        winners.truncate(LOTTERY_WINNER_COUNT);
        winners
    }

    fn index_spend(
        &self,
        batch: &mut WriteBatch,
        prevout: &OutPoint,
        output: &TxOut,
        txid: Hash256,
        input_index: u32,
        height: i32,
        tx_position: u32,
    ) {
        let address = address_key(&output.script_pubkey);
        let (address_type, address_hash) = address.unwrap_or((0, [0u8; 20]));
        self.spent_index.insert(
            batch,
            prevout,
            SpentIndexValue {
                txid,
                input_index,
                block_height: height as u32,
                satoshis: output.value,
                address_type,
                address_hash,
            },
        );
        if address.is_none() {
            return;
        }
        self.address_index.delete_unspent(
            batch,
            &AddressUnspentKey {
                address_type,
                address_hash,
                txid: prevout.hash,
                output_index: prevout.index,
            },
        );
        self.address_index.put_delta(
            batch,
            &AddressIndexKey {
                address_type,
                address_hash,
                height,
                tx_position,
                txid,
                output_index: input_index,
                spending: true,
            },
            -output.value,
        );
    }

    fn index_outputs(
        &self,
        batch: &mut WriteBatch,
        tx: &Transaction,
        txid: Hash256,
        height: i32,
        tx_position: u32,
    ) {
        for (output_index, output) in tx.vout.iter().enumerate() {
            let Some((address_type, address_hash)) = address_key(&output.script_pubkey) else {
                continue;
            };
            self.address_index.put_unspent(
                batch,
                &AddressUnspentKey {
                    address_type,
                    address_hash,
                    txid,
                    output_index: output_index as u32,
                },
                &AddressUnspentValue {
                    satoshis: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                },
            );
            self.address_index.put_delta(
                batch,
                &AddressIndexKey {
                    address_type,
                    address_hash,
                    height,
                    tx_position,
                    txid,
                    output_index: output_index as u32,
                    spending: false,
                },
                output.value,
            );
        }
    }

    /// Reverses the tip block from its undo record.
    fn disconnect_tip(&self, inner: &mut ChainInner<S>) -> Result<(), ChainStateError> {
        let tip_idx = inner
            .chain
            .tip()
            .ok_or(ChainStateError::Corrupt("no tip to disconnect"))?;
        let entry = inner.tree.entry(tip_idx).clone();
        if !entry.has_flag(STATUS_HAVE_UNDO) {
            return Err(ChainStateError::Corrupt("tip has no undo data"));
        }
        let block = self.read_block(&entry)?;
        let undo_bytes = self
            .block_files
            .read_undo(DiskPos::new(entry.file, entry.undo_pos))?;
        let undo: BlockUndo = decode(&undo_bytes)
            .map_err(|_| ChainStateError::Corrupt("stored undo undecodable"))?;
        if undo.txs.len() + 1 != block.transactions.len() {
            return Err(ChainStateError::Corrupt("undo record out of step"));
        }

        let parent_hash = entry
            .parent
            .map(|parent| inner.tree.entry(parent).hash)
            .ok_or(ChainStateError::Corrupt("cannot disconnect genesis"))?;

        let mut tree_batch = WriteBatch::new();

        // Remove created outputs and restore spends, newest transaction
        // first.
        for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.txid();
            inner.coins.erase_coins(&txid)?;
            if self.config.extra_indexes {
                for (output_index, output) in tx.vout.iter().enumerate() {
                    if let Some((address_type, address_hash)) =
                        address_key(&output.script_pubkey)
                    {
                        self.address_index.delete_unspent(
                            &mut tree_batch,
                            &AddressUnspentKey {
                                address_type,
                                address_hash,
                                txid,
                                output_index: output_index as u32,
                            },
                        );
                        self.address_index.delete_delta(
                            &mut tree_batch,
                            &AddressIndexKey {
                                address_type,
                                address_hash,
                                height: entry.height,
                                tx_position: tx_index as u32,
                                txid,
                                output_index: output_index as u32,
                                spending: false,
                            },
                        );
                    }
                }
            }
            self.tx_index
                .delete(&mut tree_batch, &txid, &tx.bare_txid());

            if tx_index > 0 {
                let tx_undo = &undo.txs[tx_index - 1];
                if tx_undo.spent.len() != tx.vin.len() {
                    return Err(ChainStateError::Corrupt("undo inputs out of step"));
                }
                for (input_index, (input, spent)) in
                    tx.vin.iter().zip(tx_undo.spent.iter()).enumerate().rev()
                {
                    let meta = spent
                        .meta
                        .map(|meta| (meta.version, meta.coinbase, meta.coinstake, meta.height));
                    inner.coins.restore_output(
                        &input.prevout.hash,
                        input.prevout.index,
                        spent.output.clone(),
                        meta,
                    )?;
                    if self.config.extra_indexes {
                        self.spent_index.delete(&mut tree_batch, &input.prevout);
                        if let Some((address_type, address_hash)) =
                            address_key(&spent.output.script_pubkey)
                        {
                            self.address_index.put_unspent(
                                &mut tree_batch,
                                &AddressUnspentKey {
                                    address_type,
                                    address_hash,
                                    txid: input.prevout.hash,
                                    output_index: input.prevout.index,
                                },
                                &AddressUnspentValue {
                                    satoshis: spent.output.value,
                                    script_pubkey: spent.output.script_pubkey.clone(),
                                    height: spent.meta.map(|m| m.height).unwrap_or(0),
                                },
                            );
                            self.address_index.delete_delta(
                                &mut tree_batch,
                                &AddressIndexKey {
                                    address_type,
                                    address_hash,
                                    height: entry.height,
                                    tx_position: tx_index as u32,
                                    txid,
                                    output_index: input_index as u32,
                                    spending: true,
                                },
                            );
                        }
                    }
                }
            }
        }

        if let Some(stake) = entry.stake {
            inner.stake_seen.remove(&(stake.prevout, stake.time));
        }

        inner.coins.set_best_block(parent_hash);
        inner.chain.pop(&mut inner.tree);

        self.write_index_entry(&inner.tree, tip_idx, &mut tree_batch);
        self.tree_db.store().write_batch(&tree_batch)?;

        izzy_log::log_debug!(
            "disconnected {} at height {}",
            hash256_to_hex(&entry.hash),
            entry.height
        );
        Ok(())
    }

    /// Marks `idx` failed and its descendants failed-parent, persisting
    /// the updated entries.
    fn mark_failed(&self, inner: &mut ChainInner<S>, idx: usize) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        inner.tree.entry_mut(idx).status |= STATUS_FAILED;
        self.write_index_entry(&inner.tree, idx, &mut batch);

        for descendant in self.collect_descendants(&inner.tree, idx) {
            inner.tree.entry_mut(descendant).status |= STATUS_FAILED_PARENT;
            self.write_index_entry(&inner.tree, descendant, &mut batch);
        }
        self.tree_db.store().write_batch(&batch)?;
        Ok(())
    }

    fn collect_descendants(&self, tree: &BlockTree, root: usize) -> Vec<usize> {
        let root_height = tree.entry(root).height;
        let mut descendants = Vec::new();
        for (idx, entry) in tree.iter() {
            if idx == root || entry.height <= root_height {
                continue;
            }
            if tree.ancestor(idx, root_height) == Some(root) {
                descendants.push(idx);
            }
        }
        descendants
    }

    /// Marks the entry failed, rolls the chain off it, then re-activates
    /// from the best remaining valid candidate.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        {
            let mut inner = self.inner.lock().expect("validation lock");
            let idx = inner
                .tree
                .lookup(hash)
                .ok_or(ChainStateError::UnknownBlock)?;
            self.mark_failed(&mut inner, idx)?;

            while let Some(tip_idx) = inner.chain.tip() {
                if !inner.tree.entry(tip_idx).is_failed() {
                    break;
                }
                self.disconnect_tip(&mut inner)?;
            }
            self.flush_locked(&mut inner, FlushMode::Always)?;
        }
        self.activate_best_chain(FlushMode::IfNeeded)?;
        Ok(())
    }

    /// Clears failure flags on the entry and its descendants and
    /// re-evaluates the best chain.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        {
            let mut inner = self.inner.lock().expect("validation lock");
            let idx = inner
                .tree
                .lookup(hash)
                .ok_or(ChainStateError::UnknownBlock)?;
            let mut batch = WriteBatch::new();
            inner.tree.entry_mut(idx).status &= !(STATUS_FAILED | STATUS_FAILED_PARENT);
            self.write_index_entry(&inner.tree, idx, &mut batch);
            for descendant in self.collect_descendants(&inner.tree, idx) {
                inner.tree.entry_mut(descendant).status &=
                    !(STATUS_FAILED | STATUS_FAILED_PARENT);
                self.write_index_entry(&inner.tree, descendant, &mut batch);
            }
            self.tree_db.store().write_batch(&batch)?;
        }
        self.activate_best_chain(FlushMode::IfNeeded)?;
        Ok(())
    }

    fn flush_locked(
        &self,
        inner: &mut ChainInner<S>,
        mode: FlushMode,
    ) -> Result<(), ChainStateError> {
        let over_budget = inner.coins.memory_usage() > self.config.coins_cache_bytes;
        let mut last_flush = self.last_flush.lock().expect("flush clock lock");
        let periodic_due = last_flush.elapsed() >= self.config.periodic_flush_interval;

        let do_flush = match mode {
            FlushMode::IfNeeded => over_budget,
            FlushMode::Periodic => over_budget || periodic_due,
            FlushMode::Always => true,
        };
        if !do_flush {
            return Ok(());
        }

        // The best-block marker always travels in the same batch as the
        // coin deltas.
        if let Some(tip_idx) = inner.chain.tip() {
            let tip_hash = inner.tree.entry(tip_idx).hash;
            inner.coins.set_best_block(tip_hash);
        }
        inner
            .coins
            .flush()
            .map_err(|_| self.abort_node("failed to flush coin database"))?;
        *last_flush = Instant::now();
        Ok(())
    }

    /// Flushes the coin cache per the given mode.
    pub fn flush(&self, mode: FlushMode) -> Result<(), ChainStateError> {
        let mut inner = self.inner.lock().expect("validation lock");
        self.flush_locked(&mut inner, mode)
    }

    fn write_index_entry(&self, tree: &BlockTree, idx: usize, batch: &mut WriteBatch) {
        let entry = tree.entry(idx);
        let prev_hash = entry
            .parent
            .map(|parent| tree.entry(parent).hash)
            .unwrap_or([0u8; 32]);
        let next_hash = entry
            .next
            .map(|next| tree.entry(next).hash)
            .unwrap_or([0u8; 32]);
        let disk = DiskBlockIndex::from_entry(entry, prev_hash, next_hash);
        self.tree_db.write_block_index(batch, &disk);
    }

    /// True while the tip is older than the configured horizon or behind
    /// the compiled-in checkpoints.
    pub fn is_initial_block_download(&self) -> bool {
        let inner = self.inner.lock().expect("validation lock");
        let tip_idx = match inner.chain.tip() {
            Some(idx) => idx,
            None => return true,
        };
        let tip = inner.tree.entry(tip_idx);
        if let Some(checkpoint) = self.params.last_checkpoint() {
            if tip.height < checkpoint.height {
                return true;
            }
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        (tip.time as i64) < now - IBD_TIP_AGE
    }

    // Read accessors. Each takes the validation lock for its duration.

    pub fn tip_hash(&self) -> Option<Hash256> {
        let inner = self.inner.lock().expect("validation lock");
        inner.chain.tip().map(|idx| inner.tree.entry(idx).hash)
    }

    pub fn tip_height(&self) -> i32 {
        let inner = self.inner.lock().expect("validation lock");
        inner.chain.height()
    }

    pub fn block_index_entry(&self, hash: &Hash256) -> Option<BlockIndexEntry> {
        let inner = self.inner.lock().expect("validation lock");
        inner
            .tree
            .lookup(hash)
            .map(|idx| inner.tree.entry(idx).clone())
    }

    pub fn chain_contains(&self, hash: &Hash256) -> bool {
        let inner = self.inner.lock().expect("validation lock");
        inner
            .tree
            .lookup(hash)
            .map(|idx| inner.chain.contains(&inner.tree, idx))
            .unwrap_or(false)
    }

    pub fn block_hash_at_height(&self, height: i32) -> Option<Hash256> {
        let inner = self.inner.lock().expect("validation lock");
        inner.chain.at(height).map(|idx| inner.tree.entry(idx).hash)
    }

    pub fn utxo(&self, txid: &Hash256) -> Result<Option<Coins>, ChainStateError> {
        let mut inner = self.inner.lock().expect("validation lock");
        Ok(inner.coins.coins(txid)?)
    }

    pub fn stake_seen_len(&self) -> usize {
        let inner = self.inner.lock().expect("validation lock");
        inner.stake_seen.len()
    }

    pub fn stake_seen_contains(&self, prevout: &OutPoint, time: u32) -> bool {
        let inner = self.inner.lock().expect("validation lock");
        inner.stake_seen.contains(&(*prevout, time))
    }

    pub fn index_len(&self) -> usize {
        let inner = self.inner.lock().expect("validation lock");
        inner.tree.len()
    }

    pub fn locator(&self) -> Vec<Hash256> {
        let inner = self.inner.lock().expect("validation lock");
        inner.chain.locator(&inner.tree, None)
    }

    pub fn find_fork(&self, locator: &[Hash256]) -> Option<Hash256> {
        let inner = self.inner.lock().expect("validation lock");
        inner
            .chain
            .find_fork(&inner.tree, locator)
            .map(|idx| inner.tree.entry(idx).hash)
    }

    /// Persisted coin commitment, bypassing the cache. Flush first for a
    /// tip-consistent answer.
    pub fn coin_stats(&self) -> Result<CoinStats, ChainStateError> {
        let db = CoinsDb::new(Arc::clone(&self.coin_store));
        match coin_stats(&db, &self.interrupt) {
            Ok(stats) => Ok(stats),
            Err(CoinStatsError::Interrupted) => Err(ChainStateError::Interrupted),
            Err(CoinStatsError::Store(err)) => Err(ChainStateError::Store(err)),
        }
    }

    /// Threshold state the next block would see for `pos`.
    pub fn versionbits_state(&self, pos: DeploymentPos) -> ThresholdState {
        let inner = self.inner.lock().expect("validation lock");
        let deployment = self.params.deployment(pos);
        self.versionbits
            .state(&inner.tree, inner.chain.tip(), deployment, pos)
    }

    pub fn spent_info(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<SpentIndexValue>, ChainStateError> {
        Ok(self.spent_index.get(outpoint)?)
    }

    pub fn address_unspent_outpoints(
        &self,
        script_pubkey: &[u8],
    ) -> Result<Vec<OutPoint>, ChainStateError> {
        let Some((address_type, address_hash)) = address_key(script_pubkey) else {
            return Ok(Vec::new());
        };
        Ok(self
            .address_index
            .unspent_outpoints(address_type, &address_hash)?)
    }

    pub fn tx_location(&self, id: &Hash256) -> Result<Option<TxDiskPos>, ChainStateError> {
        Ok(self.tx_index.get(id)?)
    }
}
