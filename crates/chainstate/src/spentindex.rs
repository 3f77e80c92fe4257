//! Spent-output index: outpoint to the transaction that consumed it.

use izzy_consensus::{Amount, Hash256};
use izzy_primitives::outpoint::OutPoint;
use izzy_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const SPENT_INDEX_VALUE_LEN: usize = 69;

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.hash);
    key[32..].copy_from_slice(&outpoint.index.to_le_bytes());
    key
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpentIndexValue {
    pub txid: Hash256,
    pub input_index: u32,
    pub block_height: u32,
    pub satoshis: Amount,
    pub address_type: u8,
    pub address_hash: [u8; 20],
}

impl SpentIndexValue {
    pub fn encode(&self) -> [u8; SPENT_INDEX_VALUE_LEN] {
        let mut out = [0u8; SPENT_INDEX_VALUE_LEN];
        out[0..32].copy_from_slice(&self.txid);
        out[32..36].copy_from_slice(&self.input_index.to_le_bytes());
        out[36..40].copy_from_slice(&self.block_height.to_le_bytes());
        out[40..48].copy_from_slice(&self.satoshis.to_le_bytes());
        out[48] = self.address_type;
        out[49..69].copy_from_slice(&self.address_hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SPENT_INDEX_VALUE_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[0..32]);
        let input_index = u32::from_le_bytes(bytes[32..36].try_into().ok()?);
        let block_height = u32::from_le_bytes(bytes[36..40].try_into().ok()?);
        let satoshis = i64::from_le_bytes(bytes[40..48].try_into().ok()?);
        let address_type = bytes[48];
        let mut address_hash = [0u8; 20];
        address_hash.copy_from_slice(&bytes[49..69]);
        Some(Self {
            txid,
            input_index,
            block_height,
            satoshis,
            address_type,
            address_hash,
        })
    }
}

pub struct SpentIndex<S> {
    store: S,
}

impl<S> SpentIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> SpentIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, outpoint: &OutPoint, value: SpentIndexValue) {
        batch.put(Column::SpentIndex, outpoint_key(outpoint), value.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::SpentIndex, outpoint_key(outpoint));
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SpentIndexValue>, StoreError> {
        let bytes = match self.store.get(Column::SpentIndex, &outpoint_key(outpoint))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        SpentIndexValue::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid spent index entry".to_string()))
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use izzy_storage::memory::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn insert_get_delete() {
        let store = Arc::new(MemoryStore::new());
        let index = SpentIndex::new(Arc::clone(&store));
        let outpoint = OutPoint::new([4u8; 32], 2);
        let value = SpentIndexValue {
            txid: [9u8; 32],
            input_index: 1,
            block_height: 55,
            satoshis: 1_234,
            address_type: 1,
            address_hash: [6u8; 20],
        };

        let mut batch = WriteBatch::new();
        index.insert(&mut batch, &outpoint, value);
        store.write_batch(&batch).expect("write");
        assert_eq!(index.get(&outpoint).expect("get"), Some(value));

        let mut batch = WriteBatch::new();
        index.delete(&mut batch, &outpoint);
        store.write_batch(&batch).expect("write");
        assert_eq!(index.get(&outpoint).expect("get"), None);
    }
}
