mod common;

use common::{new_node, spend_tx, ChainBuilder, StakeSpec};
use izzy_chainstate::tree::{STATUS_HEADER_VALID, STATUS_SCRIPTS_VALID};
use izzy_chainstate::FlushMode;
use izzy_consensus::{chain_params, Network};
use izzy_primitives::script::p2pkh_script;
use izzy_primitives::OutPoint;

/// Spec scenario: a competing branch with more cumulative work displaces
/// five blocks of the active chain, and every side effect of the
/// displaced blocks is reverted.
#[test]
fn heavier_branch_reorganises_tip() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    // Common trunk up to height 95.
    for _ in 1..=95 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("trunk block");
    }
    let fork_builder = builder.clone();

    // Branch X: heights 96..=100; block 96 spends the coinbase of
    // height 5.
    let (spent_outpoint, spent_value) = builder.coinbase_outpoint(5);
    let spend = spend_tx(spent_outpoint, spent_value, 0x77);
    let spend_txid = spend.txid();
    let block96 = builder.next_pow_with(0x01, vec![spend], 0, izzy_chainstate::validation::VERSIONBITS_TOP_BITS);
    node.state.accept_block(&block96).expect("x 96");
    let mut x_hashes = vec![block96.hash()];
    for _ in 97..=100 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("x block");
        x_hashes.push(block.hash());
    }

    assert_eq!(node.state.tip_height(), 100);
    assert_eq!(node.state.tip_hash(), Some(builder.tip_hash));
    // X's spend is live: the old coinbase is gone from the coin set.
    assert_eq!(node.state.utxo(&spent_outpoint.hash).expect("utxo"), None);
    assert!(node
        .state
        .spent_info(&spent_outpoint)
        .expect("spent index")
        .is_some());
    assert_eq!(
        node.state
            .address_unspent_outpoints(&p2pkh_script(&[0x77; 20]))
            .expect("address index"),
        vec![OutPoint::new(spend_txid, 0)]
    );

    // Branch Y: six blocks from the same fork point, ending in a staked
    // block at height 101; more total work than X.
    let mut y_builder = fork_builder;
    let (stake_outpoint, stake_value) = y_builder.coinbase_outpoint(6);
    let mut y_hashes = Vec::new();
    for _ in 96..=100 {
        let block = y_builder.next_pow(0x02);
        node.state.accept_block(&block).expect("y block");
        y_hashes.push(block.hash());
    }
    let stake_time;
    {
        let block = y_builder.next_pos(
            0x02,
            StakeSpec {
                prevout: stake_outpoint,
                value: stake_value,
            },
        );
        stake_time = block.header.time;
        node.state.accept_block(&block).expect("y stake block");
        y_hashes.push(block.hash());
    }

    // The staked branch won.
    assert_eq!(node.state.tip_height(), 101);
    assert_eq!(node.state.tip_hash(), Some(*y_hashes.last().expect("tip")));
    for hash in &y_hashes {
        assert!(node.state.chain_contains(hash));
    }

    // The displaced blocks keep their validity flags but left the active
    // chain.
    for hash in &x_hashes {
        assert!(!node.state.chain_contains(hash));
        let entry = node.state.block_index_entry(hash).expect("x entry");
        assert!(entry.has_flag(STATUS_HEADER_VALID));
        assert!(entry.has_flag(STATUS_SCRIPTS_VALID));
        assert!(!entry.is_failed());
    }

    // X's spend was rolled back: the coinbase of height 5 is unspent
    // again and the spend's side effects are gone.
    let restored = node
        .state
        .utxo(&spent_outpoint.hash)
        .expect("utxo")
        .expect("restored coinbase");
    assert!(restored.is_available(spent_outpoint.index));
    assert!(restored.coinbase);
    assert_eq!(node.state.utxo(&spend_txid).expect("utxo"), None);
    assert_eq!(
        node.state.spent_info(&spent_outpoint).expect("spent index"),
        None
    );
    assert!(node
        .state
        .address_unspent_outpoints(&p2pkh_script(&[0x77; 20]))
        .expect("address index")
        .is_empty());

    // X coinbases left the coin set; Y coinbases are live.
    for height in [96, 97] {
        let old_builder_txid = builder.coinbase_txid(height);
        assert_eq!(node.state.utxo(&old_builder_txid).expect("utxo"), None);
    }
    let y_cb = y_builder.coinbase_txid(98);
    assert!(node.state.utxo(&y_cb).expect("utxo").is_some());

    // The stake kernel of the winning branch is the only seen stake.
    assert_eq!(node.state.stake_seen_len(), 1);
    assert!(node.state.stake_seen_contains(&stake_outpoint, stake_time));
    // The staked coinbase was consumed.
    assert_eq!(node.state.utxo(&stake_outpoint.hash).expect("utxo"), None);

    // Round trip: the persisted coin commitment matches the recorded
    // supply once flushed.
    node.state.flush(FlushMode::Always).expect("flush");
    let stats = node.state.coin_stats().expect("coin stats");
    let tip_entry = node
        .state
        .block_index_entry(&y_hashes[y_hashes.len() - 1])
        .expect("tip entry");
    assert_eq!(stats.best_block, Some(tip_entry.hash));
    assert_eq!(stats.total_amount, tip_entry.money_supply);
}

/// Disconnecting a branch and reconnecting it restores identical state.
#[test]
fn disconnect_then_reconnect_round_trip() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=40 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("block");
    }
    node.state.flush(FlushMode::Always).expect("flush");
    let stats_before = node.state.coin_stats().expect("stats");
    let tip_before = node.state.tip_hash().expect("tip");

    // Invalidate 36, dropping five blocks; then reconsider to restore.
    let hash36 = builder.block_at(36).hash();
    node.state.invalidate_block(&hash36).expect("invalidate");
    assert_eq!(node.state.tip_height(), 35);
    node.state.reconsider_block(&hash36).expect("reconsider");
    assert_eq!(node.state.tip_height(), 40);
    assert_eq!(node.state.tip_hash(), Some(tip_before));

    node.state.flush(FlushMode::Always).expect("flush");
    let stats_after = node.state.coin_stats().expect("stats");
    assert_eq!(stats_after, stats_before);
}
