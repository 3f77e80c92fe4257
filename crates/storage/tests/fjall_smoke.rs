#![cfg(feature = "fjall")]

use izzy_storage::fjall::FjallStore;
use izzy_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn batch_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open(dir.path()).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, b"tx".as_slice(), b"coins".as_slice());
        batch.put(Column::CoinsMeta, b"B".as_slice(), [7u8; 32]);
        store.write_batch(&batch).expect("write");
        store.persist().expect("persist");
    }

    let store = FjallStore::open(dir.path()).expect("reopen");
    assert_eq!(
        store.get(Column::Coins, b"tx").expect("get"),
        Some(b"coins".to_vec())
    );
    assert_eq!(
        store.get(Column::CoinsMeta, b"B").expect("get"),
        Some(vec![7u8; 32])
    );
    assert_eq!(store.get(Column::Coins, b"other").expect("get"), None);
}

#[test]
fn delete_in_batch_wins_over_earlier_put() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open");

    store.put(Column::SpentIndex, b"op", b"v").expect("put");
    let mut batch = WriteBatch::new();
    batch.delete(Column::SpentIndex, b"op".as_slice());
    store.write_batch(&batch).expect("write");

    assert_eq!(store.get(Column::SpentIndex, b"op").expect("get"), None);
}
