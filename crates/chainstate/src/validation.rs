//! Transaction and block validation.
//!
//! Context-free checks live here as pure functions; the chain manager
//! supplies chain context (parents, coins, difficulty windows) and calls
//! back in for the contextual pieces.

use izzy_consensus::subsidy::BlockPayees;
use izzy_consensus::{Amount, ChainParams, Hash256};
use izzy_pow::{check_proof_of_work, expand_compact};
use izzy_primitives::block::Block;
use izzy_primitives::encoding::{encode, Encoder};
use izzy_primitives::hash::sha256d;
use izzy_primitives::merkle::merkle_root_with_mutation;
use izzy_primitives::outpoint::OutPoint;
use izzy_primitives::script::{
    classify_script_pubkey, height_script_prefix, is_push_only, legacy_sigops, ScriptType,
    MAX_SCRIPT_SIZE,
};
use izzy_primitives::transaction::{Transaction, TxOut};
use primitive_types::U256;
use rayon::prelude::*;
use std::collections::HashSet;

pub const MAX_BLOCK_SIZE: usize = 2_000_000;
pub const MAX_BLOCK_SIGOPS: u32 = (MAX_BLOCK_SIZE / 50) as u32;
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
pub const MAX_STANDARD_SCRIPT_SIG_SIZE: usize = 1_650;

/// Coinbases start committing to their height once the chain is past the
/// bootstrap blocks.
pub const HEIGHT_IN_COINBASE: i32 = 20;

pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: i32 = 0xe000_0000u32 as i32;

const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// A `Consensus` error permanently invalidates the object; a `Transient`
/// one may clear up later (missing parent, orphaned input) and must not
/// mark anything failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationError {
    Consensus(&'static str),
    Transient(&'static str),
}

impl ValidationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ValidationError::Transient(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Consensus(reason) | ValidationError::Transient(reason) => reason,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Consensus(reason) => write!(f, "{reason}"),
            ValidationError::Transient(reason) => write!(f, "{reason} (retriable)"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Context-independent transaction checks.
pub fn check_transaction(tx: &Transaction, params: &ChainParams) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::Consensus("transaction has no inputs"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::Consensus("transaction has no outputs"));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::Consensus("transaction over block size"));
    }

    let mut value_out: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::Consensus("negative output value"));
        }
        if output.value > params.max_money_out {
            return Err(ValidationError::Consensus("output value too large"));
        }
        if output.script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(ValidationError::Consensus("output script too large"));
        }
        value_out = value_out
            .checked_add(output.value)
            .ok_or(ValidationError::Consensus("output total overflows"))?;
        if value_out > params.max_money_out {
            return Err(ValidationError::Consensus("output total too large"));
        }
    }

    let mut seen_inputs = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen_inputs.insert(input.prevout) {
            return Err(ValidationError::Consensus("duplicate input"));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(ValidationError::Consensus(
                "coinbase script length out of range",
            ));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::Consensus(
            "non-coinbase input with null prevout",
        ));
    }

    Ok(())
}

/// Standardness policy for mempool admission; never consensus.
pub fn is_standard_tx(tx: &Transaction) -> Result<(), &'static str> {
    if tx.version > izzy_primitives::transaction::TX_CURRENT_VERSION || tx.version < 1 {
        return Err("version");
    }
    if tx.serialized_size() > MAX_STANDARD_TX_SIZE {
        return Err("tx-size");
    }
    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPT_SIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }
    for output in &tx.vout {
        if classify_script_pubkey(&output.script_pubkey) == ScriptType::Nonstandard {
            return Err("scriptpubkey");
        }
    }
    Ok(())
}

/// BIP68-era finality: a lock time below the threshold is a height, above
/// it a timestamp compared against the BIP113 median-time cutoff.
pub fn is_final_tx(tx: &Transaction, height: i32, cutoff_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as i64;
    let compare = if lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        cutoff_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == u32::MAX)
}

/// Context-independent block checks. Returns the txids so callers do not
/// hash twice.
pub fn check_block(block: &Block, params: &ChainParams) -> Result<Vec<Hash256>, ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationError::Consensus("block has no transactions"));
    }
    if block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::Consensus("block size too large"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::Consensus("first transaction not coinbase"));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationError::Consensus("extra coinbase"));
        }
    }

    let proof_of_stake = block.is_proof_of_stake();
    if proof_of_stake {
        // The coinbase of a staked block mints nothing itself; the
        // coinstake carries the rewards.
        if !block.transactions[0].vout.iter().all(TxOut::is_empty) {
            return Err(ValidationError::Consensus(
                "coinbase of staked block pays outputs",
            ));
        }
        for tx in &block.transactions[2..] {
            if tx.is_coinstake() {
                return Err(ValidationError::Consensus("extra coinstake"));
            }
        }
    }

    for tx in &block.transactions {
        check_transaction(tx, params)?;
    }

    let sigops: u32 = block
        .transactions
        .iter()
        .map(|tx| {
            let inputs: u32 = tx.vin.iter().map(|i| legacy_sigops(&i.script_sig)).sum();
            let outputs: u32 = tx
                .vout
                .iter()
                .map(|o| legacy_sigops(&o.script_pubkey))
                .sum();
            inputs + outputs
        })
        .sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::Consensus("too many sigops"));
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
    let mut seen = HashSet::with_capacity(txids.len());
    for txid in &txids {
        if !seen.insert(*txid) {
            return Err(ValidationError::Consensus("duplicate transaction"));
        }
    }

    let (root, mutated) = merkle_root_with_mutation(&txids);
    if mutated {
        return Err(ValidationError::Consensus("merkle tree mutated"));
    }
    if root != block.header.merkle_root {
        return Err(ValidationError::Consensus("merkle root mismatch"));
    }

    if !proof_of_stake && !check_proof_of_work(&block.hash(), block.header.bits, params) {
        return Err(ValidationError::Consensus("proof of work failed"));
    }

    Ok(txids)
}

/// Coinbase must start with the height push once past the bootstrap
/// window.
pub fn check_coinbase_height(block: &Block, height: i32) -> Result<(), ValidationError> {
    if height <= HEIGHT_IN_COINBASE {
        return Ok(());
    }
    let expected = height_script_prefix(height);
    if !block.transactions[0].vin[0].script_sig.starts_with(&expected) {
        return Err(ValidationError::Consensus("coinbase height mismatch"));
    }
    Ok(())
}

/// Version-bits discipline: once the stake-modifier deployment is active
/// the top bits of the version must carry the reserved pattern.
pub fn check_version_bits(version: i32, posv2_active: bool) -> Result<(), ValidationError> {
    if posv2_active && (version & VERSIONBITS_TOP_MASK) != VERSIONBITS_TOP_BITS {
        return Err(ValidationError::Consensus("obsolete block version"));
    }
    Ok(())
}

/// The scheduled payout outputs the reward transaction must contain.
pub fn check_payment_outputs(
    reward_tx: &Transaction,
    payees: &BlockPayees,
) -> Result<(), ValidationError> {
    if payees.lottery > 0
        && !reward_tx.vout.iter().any(|out| out.value == payees.lottery)
    {
        return Err(ValidationError::Consensus("lottery payment missing"));
    }
    if payees.treasury > 0
        && !reward_tx
            .vout
            .iter()
            .any(|out| out.value == payees.treasury)
    {
        return Err(ValidationError::Consensus("treasury payment missing"));
    }
    if payees.masternode > 0
        && !reward_tx
            .vout
            .iter()
            .any(|out| out.value == payees.masternode)
    {
        return Err(ValidationError::Consensus("masternode payment invalid"));
    }
    Ok(())
}

/// Kernel hash binding a stake to its modifier, outpoint and time.
pub fn proof_of_stake_hash(prev_modifier: u64, prevout: &OutPoint, stake_time: u32) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(prev_modifier);
    encoder.write_hash(&prevout.hash);
    encoder.write_u32_le(prevout.index);
    encoder.write_u32_le(stake_time);
    sha256d(&encoder.into_inner())
}

/// Next stake modifier, folded from the previous one and the block hash.
pub fn next_stake_modifier(prev_modifier: u64, block_hash: &Hash256) -> u64 {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(prev_modifier);
    encoder.write_hash(block_hash);
    let digest = sha256d(&encoder.into_inner());
    u64::from_le_bytes(digest[..8].try_into().expect("digest length"))
}

/// Stake kernel target check: the base target is weighted by the staked
/// value, so larger stakes hit proportionally more often.
pub fn check_stake_kernel(
    pos_hash: &Hash256,
    bits: u32,
    stake_value: Amount,
) -> Result<(), ValidationError> {
    let base = expand_compact(bits)
        .map_err(|_| ValidationError::Consensus("invalid stake target"))?;
    let weight = (stake_value / izzy_consensus::COIN).max(1);
    let (weighted, overflow) = base.overflowing_mul(U256::from(weight as u64));
    let target = if overflow { U256::MAX } else { weighted };
    if U256::from_little_endian(pos_hash) > target {
        return Err(ValidationError::Consensus("stake target not met"));
    }
    Ok(())
}

/// Minimum age of the staked coin.
pub fn check_stake_age(
    stake_block_time: u32,
    stake_time: u32,
    params: &ChainParams,
) -> Result<(), ValidationError> {
    if (stake_time as i64) < stake_block_time as i64 + params.min_stake_age {
        return Err(ValidationError::Consensus("stake coin too young"));
    }
    Ok(())
}

/// Signature verification is a black-box service; the default checker
/// only enforces script shape.
pub trait SignatureChecker: Send + Sync {
    fn verify(&self, script_sig: &[u8], script_pubkey: &[u8], value: Amount) -> bool;
}

pub struct StructuralSignatureChecker;

impl SignatureChecker for StructuralSignatureChecker {
    fn verify(&self, script_sig: &[u8], script_pubkey: &[u8], _value: Amount) -> bool {
        if script_pubkey.len() > MAX_SCRIPT_SIZE || script_sig.len() > MAX_SCRIPT_SIZE {
            return false;
        }
        match classify_script_pubkey(script_pubkey) {
            ScriptType::NullData => false,
            ScriptType::PubKey | ScriptType::PubKeyHash | ScriptType::ScriptHash => {
                !script_sig.is_empty() && is_push_only(script_sig)
            }
            ScriptType::Nonstandard => true,
        }
    }
}

/// One queued input verification.
pub struct ScriptCheck {
    pub tx_index: usize,
    pub input_index: usize,
    pub script_sig: Vec<u8>,
    pub script_pubkey: Vec<u8>,
    pub value: Amount,
}

/// Runs the batch on the rayon pool; reports the first failing input.
pub fn run_script_checks(
    checks: &[ScriptCheck],
    checker: &dyn SignatureChecker,
) -> Result<(), ValidationError> {
    let failed = checks
        .par_iter()
        .find_first(|check| !checker.verify(&check.script_sig, &check.script_pubkey, check.value));
    match failed {
        Some(_) => Err(ValidationError::Consensus("script verification failed")),
        None => Ok(()),
    }
}

/// Serialized byte offset of every transaction inside `block`.
pub fn transaction_offsets(block: &Block) -> Vec<u32> {
    let header_len = encode(&block.header).len();
    let mut encoder = Encoder::new();
    encoder.write_varint(block.transactions.len() as u64);
    let mut offset = header_len + encoder.len();

    let mut offsets = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        offsets.push(offset as u32);
        offset += tx.serialized_size();
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use izzy_consensus::{chain_params, Network, COIN};
    use izzy_primitives::block::BlockHeader;
    use izzy_primitives::merkle::merkle_root;
    use izzy_primitives::script::p2pkh_script;
    use izzy_primitives::transaction::TxIn;

    fn params() -> ChainParams {
        chain_params(Network::Regtest)
    }

    fn coinbase(height: i32, value: Amount) -> Transaction {
        let mut script = height_script_prefix(height);
        script.push(0x00);
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), script)],
            vout: vec![TxOut::new(value, p2pkh_script(&[0x11; 20]))],
            lock_time: 0,
        }
    }

    fn block_with(transactions: Vec<Transaction>) -> Block {
        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
        let header = BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: merkle_root(&txids),
            time: 1_600_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
            accumulator_checkpoint: [0u8; 32],
        };
        let mut block = Block {
            header,
            transactions,
            signature: Vec::new(),
        };
        // Grind the nonce so PoW-era structure tests are deterministic.
        if !block.is_proof_of_stake() {
            let params = params();
            while !check_proof_of_work(&block.hash(), block.header.bits, &params) {
                block.header.nonce += 1;
            }
        }
        block
    }

    #[test]
    fn transaction_checks_reject_malformed() {
        let params = params();
        let good = coinbase(1, 10 * COIN);
        assert!(check_transaction(&good, &params).is_ok());

        let mut no_inputs = good.clone();
        no_inputs.vin.clear();
        assert_eq!(
            check_transaction(&no_inputs, &params),
            Err(ValidationError::Consensus("transaction has no inputs"))
        );

        let mut negative = good.clone();
        negative.vout[0].value = -5;
        assert!(check_transaction(&negative, &params).is_err());

        let mut too_rich = good.clone();
        too_rich.vout[0].value = params.max_money_out + 1;
        assert!(check_transaction(&too_rich, &params).is_err());

        let mut short_script = good.clone();
        short_script.vin[0].script_sig = vec![0x01];
        assert!(check_transaction(&short_script, &params).is_err());

        let spend = Transaction {
            version: 1,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x01, 0x02]),
                TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x01, 0x02]),
            ],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        assert_eq!(
            check_transaction(&spend, &params),
            Err(ValidationError::Consensus("duplicate input"))
        );

        let null_input = Transaction {
            version: 1,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x01]),
                TxIn::new(OutPoint::null(), vec![0x01]),
            ],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        assert!(check_transaction(&null_input, &params).is_err());
    }

    #[test]
    fn standardness_checks() {
        let tx = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x02, 0xab, 0xcd])],
            vout: vec![TxOut::new(10, p2pkh_script(&[0x22; 20]))],
            lock_time: 0,
        };
        assert!(is_standard_tx(&tx).is_ok());

        let mut weird_out = tx.clone();
        weird_out.vout[0].script_pubkey = vec![0x99];
        assert_eq!(is_standard_tx(&weird_out), Err("scriptpubkey"));

        let mut non_push = tx.clone();
        non_push.vin[0].script_sig = vec![0x76];
        assert_eq!(is_standard_tx(&non_push), Err("scriptsig-not-pushonly"));
    }

    #[test]
    fn finality_rules() {
        let mut tx = coinbase(1, COIN);
        assert!(is_final_tx(&tx, 100, 0));

        // Height-style lock time.
        tx.lock_time = 50;
        tx.vin[0].sequence = 0;
        assert!(is_final_tx(&tx, 100, 0));
        assert!(!is_final_tx(&tx, 50, 0));

        // Timestamp lock compared against the median-time cutoff.
        tx.lock_time = 1_600_000_000;
        assert!(is_final_tx(&tx, 50, 1_600_000_100));
        assert!(!is_final_tx(&tx, 50, 1_599_999_999));

        // Max sequence opts out.
        tx.vin[0].sequence = u32::MAX;
        assert!(is_final_tx(&tx, 50, 0));
    }

    #[test]
    fn block_checks_reject_structure_errors() {
        let params = params();

        let good = block_with(vec![coinbase(1, 10 * COIN)]);
        assert!(check_block(&good, &params).is_ok());

        let empty = Block {
            transactions: Vec::new(),
            ..good.clone()
        };
        assert!(check_block(&empty, &params).is_err());

        let spend = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([2u8; 32], 0), vec![0x01])],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        let not_first = block_with(vec![spend.clone(), coinbase(1, 10 * COIN)]);
        assert_eq!(
            check_block(&not_first, &params),
            Err(ValidationError::Consensus("first transaction not coinbase"))
        );

        let double_coinbase = block_with(vec![coinbase(1, 10 * COIN), coinbase(2, 10 * COIN)]);
        assert_eq!(
            check_block(&double_coinbase, &params),
            Err(ValidationError::Consensus("extra coinbase"))
        );

        let mut wrong_merkle = block_with(vec![coinbase(1, 10 * COIN)]);
        wrong_merkle.header.merkle_root = [0xfeu8; 32];
        assert_eq!(
            check_block(&wrong_merkle, &params),
            Err(ValidationError::Consensus("merkle root mismatch"))
        );

        let duplicate = block_with(vec![
            coinbase(1, 10 * COIN),
            spend.clone(),
            spend.clone(),
        ]);
        assert!(check_block(&duplicate, &params).is_err());
    }

    #[test]
    fn pos_block_structure() {
        let params = params();
        let mut empty_coinbase = coinbase(101, 0);
        empty_coinbase.vout = vec![TxOut::empty()];
        let coinstake = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([3u8; 32], 0), vec![0x01])],
            vout: vec![TxOut::empty(), TxOut::new(5 * COIN, p2pkh_script(&[0x33; 20]))],
            lock_time: 0,
        };
        let block = block_with(vec![empty_coinbase, coinstake]);
        assert!(block.is_proof_of_stake());
        assert!(check_block(&block, &params).is_ok());

        // A paying coinbase in a staked block is malformed.
        let paying_coinbase = coinbase(101, COIN);
        let coinstake = block.transactions[1].clone();
        let bad = block_with(vec![paying_coinbase, coinstake]);
        assert_eq!(
            check_block(&bad, &params),
            Err(ValidationError::Consensus(
                "coinbase of staked block pays outputs"
            ))
        );
    }

    #[test]
    fn coinbase_height_commitment() {
        let block = block_with(vec![coinbase(25, 10 * COIN)]);
        assert!(check_coinbase_height(&block, 25).is_ok());
        assert_eq!(
            check_coinbase_height(&block, 26),
            Err(ValidationError::Consensus("coinbase height mismatch"))
        );
        // Below the enforcement height anything goes.
        assert!(check_coinbase_height(&block, 5).is_ok());
    }

    #[test]
    fn version_bits_discipline() {
        assert!(check_version_bits(4, false).is_ok());
        assert!(check_version_bits(VERSIONBITS_TOP_BITS, true).is_ok());
        assert!(check_version_bits(VERSIONBITS_TOP_BITS | 0b1, true).is_ok());
        assert_eq!(
            check_version_bits(4, true),
            Err(ValidationError::Consensus("obsolete block version"))
        );
    }

    #[test]
    fn payment_presence_checks() {
        let payees = BlockPayees {
            producer: 100 * COIN,
            lottery: 500 * COIN,
            treasury: 0,
            masternode: 1_000 * COIN,
            masternode_tier: Some(izzy_consensus::MasternodeTier::Gold),
        };
        let reward = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x51, 0x51])],
            vout: vec![
                TxOut::new(100 * COIN, vec![0x51]),
                TxOut::new(500 * COIN, vec![0x52]),
                TxOut::new(1_000 * COIN, vec![0x53]),
            ],
            lock_time: 0,
        };
        assert!(check_payment_outputs(&reward, &payees).is_ok());

        let mut wrong = reward.clone();
        wrong.vout[2].value = 999 * COIN;
        assert_eq!(
            check_payment_outputs(&wrong, &payees),
            Err(ValidationError::Consensus("masternode payment invalid"))
        );
    }

    #[test]
    fn stake_kernel_weighting() {
        // An unweighted stake cannot beat the base target with a huge
        // kernel hash.
        let pos_hash = [0xffu8; 32];
        assert!(check_stake_kernel(&pos_hash, 0x207f_ffff, 1).is_err());
        // Weighting by 1000 coins overflows the base target into
        // always-accept for the regtest limit.
        let mid_hash = {
            let mut hash = [0u8; 32];
            hash[31] = 0x40;
            hash
        };
        assert!(check_stake_kernel(&mid_hash, 0x207f_ffff, 1_000 * COIN).is_ok());
        assert!(check_stake_kernel(&mid_hash, 0x207f_ffff, 1).is_ok());

        let tight_bits = 0x1d00_ffff;
        assert!(check_stake_kernel(&mid_hash, tight_bits, 1).is_err());
    }

    #[test]
    fn stake_age_rule() {
        let mut params = chain_params(Network::Main);
        params.min_stake_age = 60;
        assert!(check_stake_age(1_000, 1_060, &params).is_ok());
        assert!(check_stake_age(1_000, 1_059, &params).is_err());
    }

    #[test]
    fn script_check_batches_report_failures() {
        let checker = StructuralSignatureChecker;
        let good = ScriptCheck {
            tx_index: 1,
            input_index: 0,
            script_sig: vec![0x02, 0x01, 0x02],
            script_pubkey: p2pkh_script(&[0x44; 20]),
            value: 5,
        };
        assert!(run_script_checks(&[good], &checker).is_ok());

        let bad = ScriptCheck {
            tx_index: 1,
            input_index: 1,
            script_sig: Vec::new(),
            script_pubkey: p2pkh_script(&[0x44; 20]),
            value: 5,
        };
        assert!(run_script_checks(&[bad], &checker).is_err());
    }

    #[test]
    fn transaction_offsets_measure_serialization() {
        let block = block_with(vec![coinbase(1, COIN), coinbase(2, COIN)]);
        let offsets = transaction_offsets(&block);
        let bytes = encode(&block);
        let tx0 = encode(&block.transactions[0]);
        let tx1 = encode(&block.transactions[1]);
        assert_eq!(
            &bytes[offsets[0] as usize..offsets[0] as usize + tx0.len()],
            tx0.as_slice()
        );
        assert_eq!(
            &bytes[offsets[1] as usize..offsets[1] as usize + tx1.len()],
            tx1.as_slice()
        );
    }
}
