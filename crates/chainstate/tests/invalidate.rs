mod common;

use std::time::{SystemTime, UNIX_EPOCH};

use common::{new_node, ChainBuilder};
use izzy_chainstate::tree::{STATUS_FAILED, STATUS_FAILED_PARENT};
use izzy_consensus::{chain_params, Network};

#[test]
fn invalidate_and_reconsider_walk_the_chain() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=30 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("block");
    }
    let tip = node.state.tip_hash().expect("tip");
    let hash25 = builder.block_at(25).hash();
    let hash26 = builder.block_at(26).hash();

    node.state.invalidate_block(&hash25).expect("invalidate");

    assert_eq!(node.state.tip_height(), 24);
    let entry25 = node.state.block_index_entry(&hash25).expect("entry");
    assert!(entry25.has_flag(STATUS_FAILED));
    let entry26 = node.state.block_index_entry(&hash26).expect("entry");
    assert!(entry26.has_flag(STATUS_FAILED_PARENT));
    assert!(!node.state.chain_contains(&tip));

    // Descendants of an invalid block are refused outright.
    let mut dead_builder = builder.clone();
    let refused = dead_builder.next_pow(0x05);
    assert!(node.state.accept_block(&refused).is_err());

    node.state.reconsider_block(&hash25).expect("reconsider");
    assert_eq!(node.state.tip_height(), 30);
    assert_eq!(node.state.tip_hash(), Some(tip));
    let entry26 = node.state.block_index_entry(&hash26).expect("entry");
    assert!(!entry26.is_failed());
}

#[test]
fn initial_block_download_clears_with_a_fresh_tip() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    // Historic timestamps: the node still reports initial download.
    for _ in 1..=10 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("block");
    }
    assert!(node.state.is_initial_block_download());

    // A block stamped with the present wall clock ends it.
    builder.tip_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as u32
        - 60;
    let block = builder.next_pow(0x01);
    node.state.accept_block(&block).expect("recent block");
    assert!(!node.state.is_initial_block_download());
}

#[test]
fn locator_identifies_common_point() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=50 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("block");
    }

    let locator = node.state.locator();
    assert_eq!(locator[0], node.state.tip_hash().expect("tip"));
    assert_eq!(
        node.state.find_fork(&locator),
        node.state.tip_hash()
    );

    // A peer that only shares the trunk up to height 30 resolves there.
    let foreign = vec![[0x99u8; 32], builder.block_at(30).hash()];
    assert_eq!(
        node.state.find_fork(&foreign),
        Some(builder.block_at(30).hash())
    );
}
