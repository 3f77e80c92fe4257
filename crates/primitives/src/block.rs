//! Block header and block types.

use izzy_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;

pub const BLOCK_CURRENT_VERSION: i32 = 4;

/// Headers carry the zerocoin accumulator checkpoint from version 4 on.
const ACCUMULATOR_VERSION: i32 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub accumulator_checkpoint: Hash256,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        if self.version >= ACCUMULATOR_VERSION {
            encoder.write_hash(&self.accumulator_checkpoint);
        }
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let accumulator_checkpoint = if version >= ACCUMULATOR_VERSION {
            decoder.read_hash()?
        } else {
            [0u8; 32]
        };
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
            accumulator_checkpoint,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Staker's signature over the block hash; empty on PoW blocks. The
    /// signature scheme itself is outside this crate.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// PoS blocks carry the coinstake as their second transaction.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }

    pub fn serialized_size(&self) -> usize {
        crate::encoding::encode(self).len()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
        encoder.write_var_bytes(&self.signature);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        let signature = decoder.read_var_bytes()?;
        Ok(Self {
            header,
            transactions,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn header(version: i32) -> BlockHeader {
        BlockHeader {
            version,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_600_000_000,
            bits: 0x1e0f_fff0,
            nonce: 42,
            accumulator_checkpoint: [3u8; 32],
        }
    }

    #[test]
    fn legacy_headers_hash_over_eighty_bytes() {
        let legacy = header(1);
        assert_eq!(encode(&legacy).len(), 80);

        let modern = header(4);
        assert_eq!(encode(&modern).len(), 112);
        assert_ne!(legacy.hash(), modern.hash());
    }

    #[test]
    fn header_round_trip_both_versions() {
        for version in [1, 3, 4, 5] {
            let original = header(version);
            let decoded: BlockHeader = decode(&encode(&original)).expect("decode");
            if version >= 4 {
                assert_eq!(decoded, original);
            } else {
                assert_eq!(decoded.accumulator_checkpoint, [0u8; 32]);
                assert_eq!(decoded.version, original.version);
                assert_eq!(decoded.nonce, original.nonce);
            }
        }
    }

    #[test]
    fn block_round_trip_and_pos_detection() {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x51, 0x51])],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        };
        let coinstake = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([9u8; 32], 0), Vec::new())],
            vout: vec![TxOut::empty(), TxOut::new(10, vec![0x51])],
            lock_time: 0,
        };
        let block = Block {
            header: header(4),
            transactions: vec![coinbase, coinstake],
            signature: vec![0xaa, 0xbb],
        };
        assert!(block.is_proof_of_stake());

        let decoded: Block = decode(&encode(&block)).expect("decode");
        assert_eq!(decoded, block);
    }
}
