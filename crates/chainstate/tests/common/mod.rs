//! Shared harness for the chain-state scenario tests: an in-memory node
//! plus a deterministic block builder for the regtest network.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use izzy_chainstate::blockfiles::MemoryBlockFiles;
use izzy_chainstate::validation::VERSIONBITS_TOP_BITS;
use izzy_chainstate::{ChainState, ChainStateConfig};
use izzy_consensus::subsidy::{block_payees, BlockPayees};
use izzy_consensus::{Amount, ChainParams, Hash256};
use izzy_pow::check_proof_of_work;
use izzy_primitives::block::{Block, BlockHeader};
use izzy_primitives::genesis::checked_genesis_block;
use izzy_primitives::merkle::merkle_root;
use izzy_primitives::script::{height_script_prefix, p2pkh_script};
use izzy_primitives::transaction::{Transaction, TxIn, TxOut};
use izzy_primitives::OutPoint;
use izzy_storage::memory::MemoryStore;

pub type TestState = ChainState<MemoryStore, Arc<MemoryBlockFiles>>;

pub struct Node {
    pub params: ChainParams,
    pub tree_store: Arc<MemoryStore>,
    pub coin_store: Arc<MemoryStore>,
    pub files: Arc<MemoryBlockFiles>,
    pub state: TestState,
}

pub fn test_config() -> ChainStateConfig {
    ChainStateConfig {
        coins_cache_bytes: 64 * 1024 * 1024,
        periodic_flush_interval: Duration::from_secs(3600),
        extra_indexes: true,
        consistency_checks: true,
    }
}

pub fn new_node(params: ChainParams) -> Node {
    let tree_store = Arc::new(MemoryStore::new());
    let coin_store = Arc::new(MemoryStore::new());
    let files = Arc::new(MemoryBlockFiles::new());
    let state = ChainState::new(
        params.clone(),
        Arc::clone(&tree_store),
        Arc::clone(&coin_store),
        Arc::clone(&files),
        test_config(),
    )
    .expect("chain state boot");
    Node {
        params,
        tree_store,
        coin_store,
        files,
        state,
    }
}

/// Rebuilds the chain state over the surviving stores, as a restart
/// after a process kill would.
pub fn reopen_node(node: Node) -> Node {
    let Node {
        params,
        tree_store,
        coin_store,
        files,
        state,
    } = node;
    drop(state);
    let state = ChainState::new(
        params.clone(),
        Arc::clone(&tree_store),
        Arc::clone(&coin_store),
        Arc::clone(&files),
        test_config(),
    )
    .expect("chain state reopen");
    Node {
        params,
        tree_store,
        coin_store,
        files,
        state,
    }
}

#[derive(Clone, Copy)]
pub struct StakeSpec {
    pub prevout: OutPoint,
    pub value: Amount,
}

/// Deterministic chain construction that mirrors what the node will
/// accept; branches are made by cloning the builder at the fork point.
#[derive(Clone)]
pub struct ChainBuilder {
    pub params: ChainParams,
    pub tip_hash: Hash256,
    pub tip_time: u32,
    pub height: i32,
    /// Every built block, genesis included, indexed by height.
    pub blocks: Vec<Block>,
}

impl ChainBuilder {
    pub fn from_genesis(params: &ChainParams) -> Self {
        let genesis = checked_genesis_block(params).expect("genesis");
        Self {
            params: params.clone(),
            tip_hash: genesis.hash(),
            tip_time: genesis.header.time,
            height: 0,
            blocks: vec![genesis],
        }
    }

    pub fn block_at(&self, height: i32) -> &Block {
        &self.blocks[height as usize]
    }

    pub fn coinbase_txid(&self, height: i32) -> Hash256 {
        self.block_at(height).transactions[0].txid()
    }

    /// First spendable coinbase output of the block at `height`.
    pub fn coinbase_outpoint(&self, height: i32) -> (OutPoint, Amount) {
        let coinbase = &self.block_at(height).transactions[0];
        let index = coinbase
            .vout
            .iter()
            .position(|out| !out.is_empty())
            .expect("spendable coinbase output");
        (
            OutPoint::new(coinbase.txid(), index as u32),
            coinbase.vout[index].value,
        )
    }

    pub fn next_pow(&mut self, tag: u8) -> Block {
        self.next_pow_with(tag, Vec::new(), 0, VERSIONBITS_TOP_BITS)
    }

    pub fn next_pow_with(
        &mut self,
        tag: u8,
        extra_txs: Vec<Transaction>,
        fees: Amount,
        version: i32,
    ) -> Block {
        let height = self.height + 1;
        let payees = block_payees(height, &self.params);
        let coinbase = pow_coinbase(height, &payees, fees, tag);

        let mut transactions = vec![coinbase];
        transactions.extend(extra_txs);
        self.seal(transactions, version, Vec::new())
    }

    pub fn next_pos(&mut self, tag: u8, stake: StakeSpec) -> Block {
        self.next_pos_with(tag, stake, Vec::new(), 0)
    }

    pub fn next_pos_with(
        &mut self,
        tag: u8,
        stake: StakeSpec,
        extra_txs: Vec<Transaction>,
        fees: Amount,
    ) -> Block {
        let height = self.height + 1;
        let payees = block_payees(height, &self.params);

        let mut script = height_script_prefix(height);
        script.push(0x00);
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), script)],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        };

        let mut stake_outputs = vec![
            TxOut::empty(),
            TxOut::new(
                stake.value + payees.producer + fees,
                p2pkh_script(&[tag; 20]),
            ),
        ];
        stake_outputs.extend(payee_outputs(&payees));
        let coinstake = Transaction {
            version: 1,
            vin: vec![TxIn::new(stake.prevout, vec![0x01, 0xab])],
            vout: stake_outputs,
            lock_time: 0,
        };

        let mut transactions = vec![coinbase, coinstake];
        transactions.extend(extra_txs);
        self.seal(transactions, VERSIONBITS_TOP_BITS, vec![0x30, 0x44, tag])
    }

    fn seal(&mut self, transactions: Vec<Transaction>, version: i32, signature: Vec<u8>) -> Block {
        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
        let time = self.tip_time + 60;
        let mut block = Block {
            header: BlockHeader {
                version,
                prev_block: self.tip_hash,
                merkle_root: merkle_root(&txids),
                time,
                bits: self.params.genesis.bits,
                nonce: 0,
                accumulator_checkpoint: [0u8; 32],
            },
            transactions,
            signature,
        };
        if !block.is_proof_of_stake() {
            while !check_proof_of_work(&block.hash(), block.header.bits, &self.params) {
                block.header.nonce += 1;
            }
        }
        self.height += 1;
        self.tip_hash = block.hash();
        self.tip_time = time;
        self.blocks.push(block.clone());
        block
    }
}

fn pow_coinbase(height: i32, payees: &BlockPayees, fees: Amount, tag: u8) -> Transaction {
    let mut script = height_script_prefix(height);
    script.push(0x00);
    let mut vout = payee_outputs(payees);
    vout.push(TxOut::new(
        payees.producer + fees,
        p2pkh_script(&[tag; 20]),
    ));
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script)],
        vout,
        lock_time: 0,
    }
}

fn payee_outputs(payees: &BlockPayees) -> Vec<TxOut> {
    let mut outputs = Vec::new();
    if payees.lottery > 0 {
        outputs.push(TxOut::new(payees.lottery, p2pkh_script(&[0xee; 20])));
    }
    if payees.treasury > 0 {
        outputs.push(TxOut::new(payees.treasury, p2pkh_script(&[0xdd; 20])));
    }
    if payees.masternode > 0 {
        outputs.push(TxOut::new(payees.masternode, p2pkh_script(&[0xcc; 20])));
    }
    outputs
}

/// A fee-free transaction spending one output in full.
pub fn spend_tx(prevout: OutPoint, value: Amount, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(prevout, vec![0x01, 0xcd])],
        vout: vec![TxOut::new(value, p2pkh_script(&[tag; 20]))],
        lock_time: 0,
    }
}

/// Recomputes the merkle root after a test tampered with a transaction.
pub fn reseal_tampered(block: &mut Block, params: &ChainParams) {
    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
    block.header.merkle_root = merkle_root(&txids);
    if !block.is_proof_of_stake() {
        block.header.nonce = 0;
        while !check_proof_of_work(&block.hash(), block.header.bits, params) {
            block.header.nonce += 1;
        }
    }
}
