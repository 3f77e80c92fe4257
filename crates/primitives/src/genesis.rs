//! Genesis block construction.
//!
//! The genesis block is rebuilt from the chain-parameter seed at startup
//! and must hash to the compiled-in constants; a mismatch is a fatal
//! configuration error.

use izzy_consensus::{ChainParams, Hash256};

use crate::block::{Block, BlockHeader};
use crate::merkle::merkle_root;
use crate::outpoint::OutPoint;
use crate::script::{push_data, push_int64, OP_CHECKSIG};
use crate::transaction::{Transaction, TxIn, TxOut};

#[derive(Debug)]
pub enum GenesisError {
    BadPubkeyHex,
    HashMismatch { expected: Hash256, got: Hash256 },
    MerkleMismatch { expected: Hash256, got: Hash256 },
}

impl std::fmt::Display for GenesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenesisError::BadPubkeyHex => write!(f, "genesis pubkey is not valid hex"),
            GenesisError::HashMismatch { .. } => write!(f, "genesis block hash mismatch"),
            GenesisError::MerkleMismatch { .. } => write!(f, "genesis merkle root mismatch"),
        }
    }
}

impl std::error::Error for GenesisError {}

/// Builds the genesis block for `params` without verifying its hash.
pub fn genesis_block(params: &ChainParams) -> Result<Block, GenesisError> {
    let seed = &params.genesis;

    let mut script_sig = Vec::new();
    push_int64(&mut script_sig, 486_604_799);
    push_data(&mut script_sig, &[0x04]);
    push_data(&mut script_sig, seed.timestamp_text.as_bytes());

    let pubkey = decode_hex(seed.pubkey_hex).ok_or(GenesisError::BadPubkeyHex)?;
    let mut script_pubkey = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script_pubkey, &pubkey);
    script_pubkey.push(OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::new(seed.coinbase_value, script_pubkey)],
        lock_time: 0,
    };

    let merkle = merkle_root(&[coinbase.txid()]);
    let header = BlockHeader {
        version: seed.version,
        prev_block: [0u8; 32],
        merkle_root: merkle,
        time: seed.time,
        bits: seed.bits,
        nonce: seed.nonce,
        accumulator_checkpoint: [0u8; 32],
    };

    Ok(Block {
        header,
        transactions: vec![coinbase],
        signature: Vec::new(),
    })
}

/// Builds the genesis block and checks it against the asserted hash and
/// merkle root of `params`.
pub fn checked_genesis_block(params: &ChainParams) -> Result<Block, GenesisError> {
    let block = genesis_block(params)?;

    let merkle = block.header.merkle_root;
    if merkle != params.genesis_merkle_root {
        return Err(GenesisError::MerkleMismatch {
            expected: params.genesis_merkle_root,
            got: merkle,
        });
    }

    let hash = block.hash();
    if hash != params.hash_genesis_block {
        return Err(GenesisError::HashMismatch {
            expected: params.hash_genesis_block,
            got: hash,
        });
    }

    Ok(block)
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        out.push(u8::from_str_radix(pair, 16).ok()?);
    }
    Some(out)
}
