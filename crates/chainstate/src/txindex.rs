//! Transaction index: txid (and bare txid) to on-disk position.

use izzy_consensus::Hash256;
use izzy_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockfiles::DiskPos;

const TXID_PREFIX: u8 = b't';
const BARE_TXID_PREFIX: u8 = b'T';
const TX_POS_LEN: usize = 12;

/// Position of a transaction: block location plus the byte offset of the
/// transaction inside the block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxDiskPos {
    pub block: DiskPos,
    pub offset: u32,
}

impl TxDiskPos {
    pub fn encode(&self) -> [u8; TX_POS_LEN] {
        let mut out = [0u8; TX_POS_LEN];
        out[0..4].copy_from_slice(&self.block.file.to_le_bytes());
        out[4..8].copy_from_slice(&self.block.pos.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_POS_LEN {
            return None;
        }
        Some(Self {
            block: DiskPos {
                file: i32::from_le_bytes(bytes[0..4].try_into().ok()?),
                pos: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            },
            offset: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

fn prefixed_key(prefix: u8, txid: &Hash256) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = prefix;
    key[1..].copy_from_slice(txid);
    key
}

pub struct TxIndex<S> {
    store: S,
}

impl<S> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn put(
        &self,
        batch: &mut WriteBatch,
        txid: &Hash256,
        bare_txid: &Hash256,
        pos: TxDiskPos,
    ) {
        batch.put(Column::TxIndex, prefixed_key(TXID_PREFIX, txid), pos.encode());
        batch.put(
            Column::TxIndex,
            prefixed_key(BARE_TXID_PREFIX, bare_txid),
            pos.encode(),
        );
    }

    pub fn delete(&self, batch: &mut WriteBatch, txid: &Hash256, bare_txid: &Hash256) {
        batch.delete(Column::TxIndex, prefixed_key(TXID_PREFIX, txid));
        batch.delete(Column::TxIndex, prefixed_key(BARE_TXID_PREFIX, bare_txid));
    }

    /// Looks up by txid first, then by bare txid. The two key spaces
    /// cannot collide for distinct transactions short of a hash
    /// collision.
    pub fn get(&self, id: &Hash256) -> Result<Option<TxDiskPos>, StoreError> {
        for prefix in [TXID_PREFIX, BARE_TXID_PREFIX] {
            if let Some(bytes) = self.store.get(Column::TxIndex, &prefixed_key(prefix, id))? {
                return TxDiskPos::decode(&bytes)
                    .ok_or_else(|| StoreError::Backend("invalid tx index entry".to_string()))
                    .map(Some);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use izzy_storage::memory::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn lookup_by_either_id() {
        let store = Arc::new(MemoryStore::new());
        let index = TxIndex::new(Arc::clone(&store));
        let pos = TxDiskPos {
            block: DiskPos::new(1, 44),
            offset: 113,
        };

        let mut batch = WriteBatch::new();
        index.put(&mut batch, &[1u8; 32], &[2u8; 32], pos);
        store.write_batch(&batch).expect("write");

        assert_eq!(index.get(&[1u8; 32]).expect("get"), Some(pos));
        assert_eq!(index.get(&[2u8; 32]).expect("get"), Some(pos));
        assert_eq!(index.get(&[3u8; 32]).expect("get"), None);

        let mut batch = WriteBatch::new();
        index.delete(&mut batch, &[1u8; 32], &[2u8; 32]);
        store.write_batch(&batch).expect("write");
        assert_eq!(index.get(&[1u8; 32]).expect("get"), None);
    }
}
