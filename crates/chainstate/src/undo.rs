//! Per-block undo records, enough to reverse a block's coin effects.

use izzy_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use izzy_primitives::transaction::TxOut;

const BLOCK_UNDO_VERSION: u8 = 1;

/// One spent input. The metadata fields are set only when the spend
/// removed the final output, so the whole record can be recreated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentCoinUndo {
    pub output: TxOut,
    pub meta: Option<CoinMetaUndo>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoinMetaUndo {
    pub version: i32,
    pub coinbase: bool,
    pub coinstake: bool,
    pub height: i32,
}

/// Undo data for one transaction: its inputs in order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub spent: Vec<SpentCoinUndo>,
}

/// Undo data for one block: one record per non-coinbase transaction, in
/// block order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl Encodable for SpentCoinUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.output.consensus_encode(encoder);
        match &self.meta {
            Some(meta) => {
                encoder.write_u8(1);
                encoder.write_varint(meta.version as u64);
                let mut flags = 0u8;
                if meta.coinbase {
                    flags |= 1;
                }
                if meta.coinstake {
                    flags |= 2;
                }
                encoder.write_u8(flags);
                encoder.write_varint(meta.height as u64);
            }
            None => encoder.write_u8(0),
        }
    }
}

impl Decodable for SpentCoinUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let output = TxOut::consensus_decode(decoder)?;
        let has_meta = decoder.read_u8()?;
        let meta = match has_meta {
            0 => None,
            1 => {
                let version = decoder.read_varint()? as i32;
                let flags = decoder.read_u8()?;
                if flags & !3 != 0 {
                    return Err(DecodeError::InvalidData("unknown undo flags"));
                }
                let height = decoder.read_varint()? as i32;
                Some(CoinMetaUndo {
                    version,
                    coinbase: flags & 1 != 0,
                    coinstake: flags & 2 != 0,
                    height,
                })
            }
            _ => return Err(DecodeError::InvalidData("invalid undo meta marker")),
        };
        Ok(Self { output, meta })
    }
}

impl Encodable for BlockUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_varint(tx.spent.len() as u64);
            for spent in &tx.spent {
                spent.consensus_encode(encoder);
            }
        }
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = decoder.read_varint()? as usize;
        let mut txs = Vec::with_capacity(tx_count.min(1024));
        for _ in 0..tx_count {
            let spent_count = decoder.read_varint()? as usize;
            let mut spent = Vec::with_capacity(spent_count.min(1024));
            for _ in 0..spent_count {
                spent.push(SpentCoinUndo::consensus_decode(decoder)?);
            }
            txs.push(TxUndo { spent });
        }
        Ok(Self { txs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use izzy_primitives::encoding::{decode, encode};

    #[test]
    fn round_trip() {
        let undo = BlockUndo {
            txs: vec![
                TxUndo {
                    spent: vec![
                        SpentCoinUndo {
                            output: TxOut::new(12, vec![0x51]),
                            meta: None,
                        },
                        SpentCoinUndo {
                            output: TxOut::new(34, vec![0x52, 0x53]),
                            meta: Some(CoinMetaUndo {
                                version: 1,
                                coinbase: true,
                                coinstake: false,
                                height: 120,
                            }),
                        },
                    ],
                },
                TxUndo { spent: Vec::new() },
            ],
        };
        let decoded: BlockUndo = decode(&encode(&undo)).expect("decode");
        assert_eq!(decoded, undo);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(&BlockUndo::default());
        bytes[0] = 9;
        assert!(decode::<BlockUndo>(&bytes).is_err());
    }
}
