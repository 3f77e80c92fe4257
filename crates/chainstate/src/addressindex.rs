//! Address indexes: per-address deltas and the unspent-output listing.
//!
//! Keys sort by (type, hash160, height) so height-bounded scans are a
//! single prefix walk.

use izzy_consensus::{Amount, Hash256};
use izzy_primitives::outpoint::OutPoint;
use izzy_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const DELTA_KEY_LEN: usize = 66;
const UNSPENT_KEY_LEN: usize = 57;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressIndexKey {
    pub address_type: u8,
    pub address_hash: [u8; 20],
    pub height: i32,
    pub tx_position: u32,
    pub txid: Hash256,
    pub output_index: u32,
    pub spending: bool,
}

impl AddressIndexKey {
    pub fn encode(&self) -> [u8; DELTA_KEY_LEN] {
        let mut out = [0u8; DELTA_KEY_LEN];
        out[0] = self.address_type;
        out[1..21].copy_from_slice(&self.address_hash);
        // Big-endian height keeps the scan ordered by height.
        out[21..25].copy_from_slice(&(self.height as u32).to_be_bytes());
        out[25..29].copy_from_slice(&self.tx_position.to_be_bytes());
        out[29..61].copy_from_slice(&self.txid);
        out[61..65].copy_from_slice(&self.output_index.to_be_bytes());
        out[65] = self.spending as u8;
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DELTA_KEY_LEN {
            return None;
        }
        let mut address_hash = [0u8; 20];
        address_hash.copy_from_slice(&bytes[1..21]);
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[29..61]);
        Some(Self {
            address_type: bytes[0],
            address_hash,
            height: u32::from_be_bytes(bytes[21..25].try_into().ok()?) as i32,
            tx_position: u32::from_be_bytes(bytes[25..29].try_into().ok()?),
            txid,
            output_index: u32::from_be_bytes(bytes[61..65].try_into().ok()?),
            spending: bytes[65] != 0,
        })
    }

    fn address_prefix(address_type: u8, address_hash: &[u8; 20]) -> [u8; 21] {
        let mut prefix = [0u8; 21];
        prefix[0] = address_type;
        prefix[1..].copy_from_slice(address_hash);
        prefix
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressUnspentKey {
    pub address_type: u8,
    pub address_hash: [u8; 20],
    pub txid: Hash256,
    pub output_index: u32,
}

impl AddressUnspentKey {
    pub fn encode(&self) -> [u8; UNSPENT_KEY_LEN] {
        let mut out = [0u8; UNSPENT_KEY_LEN];
        out[0] = self.address_type;
        out[1..21].copy_from_slice(&self.address_hash);
        out[21..53].copy_from_slice(&self.txid);
        out[53..57].copy_from_slice(&self.output_index.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != UNSPENT_KEY_LEN {
            return None;
        }
        let mut address_hash = [0u8; 20];
        address_hash.copy_from_slice(&bytes[1..21]);
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[21..53]);
        Some(Self {
            address_type: bytes[0],
            address_hash,
            txid,
            output_index: u32::from_be_bytes(bytes[53..57].try_into().ok()?),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressUnspentValue {
    pub satoshis: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: i32,
}

impl AddressUnspentValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.script_pubkey.len());
        out.extend_from_slice(&self.satoshis.to_le_bytes());
        out.extend_from_slice(&(self.height as u32).to_le_bytes());
        out.extend_from_slice(&self.script_pubkey);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        Some(Self {
            satoshis: i64::from_le_bytes(bytes[0..8].try_into().ok()?),
            height: u32::from_le_bytes(bytes[8..12].try_into().ok()?) as i32,
            script_pubkey: bytes[12..].to_vec(),
        })
    }
}

pub struct AddressIndex<S> {
    store: S,
}

impl<S> AddressIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn put_delta(&self, batch: &mut WriteBatch, key: &AddressIndexKey, amount: Amount) {
        batch.put(Column::AddressIndex, key.encode(), amount.to_le_bytes());
    }

    pub fn delete_delta(&self, batch: &mut WriteBatch, key: &AddressIndexKey) {
        batch.delete(Column::AddressIndex, key.encode());
    }

    pub fn put_unspent(
        &self,
        batch: &mut WriteBatch,
        key: &AddressUnspentKey,
        value: &AddressUnspentValue,
    ) {
        batch.put(Column::AddressUnspent, key.encode(), value.encode());
    }

    pub fn delete_unspent(&self, batch: &mut WriteBatch, key: &AddressUnspentKey) {
        batch.delete(Column::AddressUnspent, key.encode());
    }

    /// Deltas for one address, optionally bounded to `[start, end]`
    /// heights. Heights are scan-ordered.
    pub fn deltas(
        &self,
        address_type: u8,
        address_hash: &[u8; 20],
        start: Option<i32>,
        end: Option<i32>,
    ) -> Result<Vec<(AddressIndexKey, Amount)>, StoreError> {
        let prefix = AddressIndexKey::address_prefix(address_type, address_hash);
        let mut out = Vec::new();
        self.store
            .for_each_prefix(Column::AddressIndex, &prefix, &mut |key, value| {
                let key = AddressIndexKey::decode(key)
                    .ok_or_else(|| StoreError::Backend("invalid address index key".to_string()))?;
                if let Some(start) = start {
                    if key.height < start {
                        return Ok(());
                    }
                }
                if let Some(end) = end {
                    if key.height > end {
                        return Ok(());
                    }
                }
                let amount = i64::from_le_bytes(
                    value
                        .try_into()
                        .map_err(|_| StoreError::Backend("invalid delta value".to_string()))?,
                );
                out.push((key, amount));
                Ok(())
            })?;
        Ok(out)
    }

    /// Unspent outputs currently credited to one address.
    pub fn unspent(
        &self,
        address_type: u8,
        address_hash: &[u8; 20],
    ) -> Result<Vec<(AddressUnspentKey, AddressUnspentValue)>, StoreError> {
        let prefix = AddressIndexKey::address_prefix(address_type, address_hash);
        let mut out = Vec::new();
        self.store
            .for_each_prefix(Column::AddressUnspent, &prefix, &mut |key, value| {
                let key = AddressUnspentKey::decode(key).ok_or_else(|| {
                    StoreError::Backend("invalid address unspent key".to_string())
                })?;
                let value = AddressUnspentValue::decode(value).ok_or_else(|| {
                    StoreError::Backend("invalid address unspent value".to_string())
                })?;
                out.push((key, value));
                Ok(())
            })?;
        Ok(out)
    }

    pub fn unspent_outpoints(
        &self,
        address_type: u8,
        address_hash: &[u8; 20],
    ) -> Result<Vec<OutPoint>, StoreError> {
        Ok(self
            .unspent(address_type, address_hash)?
            .into_iter()
            .map(|(key, _)| OutPoint::new(key.txid, key.output_index))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use izzy_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn delta_key(height: i32, spending: bool) -> AddressIndexKey {
        AddressIndexKey {
            address_type: 1,
            address_hash: [7u8; 20],
            height,
            tx_position: 0,
            txid: [height as u8; 32],
            output_index: 0,
            spending,
        }
    }

    #[test]
    fn key_round_trip() {
        let key = delta_key(4, true);
        assert_eq!(AddressIndexKey::decode(&key.encode()), Some(key));

        let unspent = AddressUnspentKey {
            address_type: 2,
            address_hash: [8u8; 20],
            txid: [3u8; 32],
            output_index: 9,
        };
        assert_eq!(AddressUnspentKey::decode(&unspent.encode()), Some(unspent));
    }

    #[test]
    fn deltas_scan_in_height_order_with_bounds() {
        let store = Arc::new(MemoryStore::new());
        let index = AddressIndex::new(Arc::clone(&store));

        let mut batch = WriteBatch::new();
        for height in [5, 1, 9, 3] {
            index.put_delta(&mut batch, &delta_key(height, false), height as i64 * 100);
        }
        // A different address must not leak into the scan.
        index.put_delta(
            &mut batch,
            &AddressIndexKey {
                address_hash: [9u8; 20],
                ..delta_key(2, false)
            },
            777,
        );
        store.write_batch(&batch).expect("write");

        let all = index.deltas(1, &[7u8; 20], None, None).expect("scan");
        let heights: Vec<i32> = all.iter().map(|(key, _)| key.height).collect();
        assert_eq!(heights, vec![1, 3, 5, 9]);

        let bounded = index.deltas(1, &[7u8; 20], Some(3), Some(5)).expect("scan");
        let heights: Vec<i32> = bounded.iter().map(|(key, _)| key.height).collect();
        assert_eq!(heights, vec![3, 5]);
    }

    #[test]
    fn unspent_listing_follows_puts_and_deletes() {
        let store = Arc::new(MemoryStore::new());
        let index = AddressIndex::new(Arc::clone(&store));
        let key = AddressUnspentKey {
            address_type: 1,
            address_hash: [7u8; 20],
            txid: [1u8; 32],
            output_index: 0,
        };
        let value = AddressUnspentValue {
            satoshis: 5_000,
            script_pubkey: vec![0x51],
            height: 11,
        };

        let mut batch = WriteBatch::new();
        index.put_unspent(&mut batch, &key, &value);
        store.write_batch(&batch).expect("write");
        assert_eq!(index.unspent(1, &[7u8; 20]).expect("scan"), vec![(key, value)]);

        let mut batch = WriteBatch::new();
        index.delete_unspent(&mut batch, &key);
        store.write_batch(&batch).expect("write");
        assert!(index.unspent(1, &[7u8; 20]).expect("scan").is_empty());
    }
}
