mod common;

use common::{new_node, ChainBuilder, StakeSpec};
use izzy_chainstate::{ChainStateError, ValidationError};
use izzy_consensus::{chain_params, Network};

/// A second block reusing an accepted stake kernel is rejected outright
/// and leaves the stake-seen set untouched.
#[test]
fn duplicate_stake_kernel_is_rejected() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=100 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("pow block");
    }

    let (stake_outpoint, stake_value) = builder.coinbase_outpoint(50);
    let stake = StakeSpec {
        prevout: stake_outpoint,
        value: stake_value,
    };

    let mut rival_builder = builder.clone();

    let block101 = builder.next_pos(0x01, stake);
    let stake_time = block101.header.time;
    node.state.accept_block(&block101).expect("stake block");

    assert_eq!(node.state.tip_height(), 101);
    assert_eq!(node.state.stake_seen_len(), 1);
    assert!(node.state.stake_seen_contains(&stake_outpoint, stake_time));

    // Same kernel, same height, different payout: consensus-invalid.
    let rival = rival_builder.next_pos(0x02, stake);
    assert_eq!(rival.header.time, stake_time);
    assert_ne!(rival.hash(), block101.hash());

    match node.state.accept_block(&rival) {
        Err(ChainStateError::Validation(ValidationError::Consensus(reason))) => {
            assert_eq!(reason, "duplicate proof of stake");
        }
        other => panic!("expected consensus rejection, got {other:?}"),
    }

    // Nothing changed: the set still holds exactly the original kernel.
    assert_eq!(node.state.stake_seen_len(), 1);
    assert!(node.state.stake_seen_contains(&stake_outpoint, stake_time));
    assert_eq!(node.state.tip_hash(), Some(block101.hash()));
    // The rejected block never entered the index.
    assert!(node.state.block_index_entry(&rival.hash()).is_none());
}

/// A different kernel at the same height is a legitimate fork, not a
/// duplicate.
#[test]
fn distinct_kernel_fork_is_accepted() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=100 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("pow block");
    }

    let mut rival_builder = builder.clone();

    let (stake_a, value_a) = builder.coinbase_outpoint(50);
    let block_a = builder.next_pos(
        0x01,
        StakeSpec {
            prevout: stake_a,
            value: value_a,
        },
    );
    node.state.accept_block(&block_a).expect("stake a");

    let (stake_b, value_b) = rival_builder.coinbase_outpoint(51);
    let block_b = rival_builder.next_pos(
        0x02,
        StakeSpec {
            prevout: stake_b,
            value: value_b,
        },
    );
    node.state.accept_block(&block_b).expect("stake b");

    // Equal work: the first seen block keeps the tip, the fork stays in
    // the index.
    assert_eq!(node.state.tip_hash(), Some(block_a.hash()));
    assert!(node.state.block_index_entry(&block_b.hash()).is_some());
    assert_eq!(node.state.stake_seen_len(), 1);
}
