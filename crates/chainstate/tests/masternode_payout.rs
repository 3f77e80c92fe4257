mod common;

use common::{new_node, reseal_tampered, ChainBuilder, StakeSpec};
use izzy_chainstate::{ChainStateError, ValidationError};
use izzy_consensus::subsidy::{block_payees, masternode_tier_for_height};
use izzy_consensus::{chain_params, MasternodeTier, Network, COIN};

/// The masternode payment at a tier-eligible height must equal that
/// tier's collateral; anything else is consensus-invalid.
#[test]
fn gold_tier_payout_must_match_collateral() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=100 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("pow block");
    }

    // Heights 101 and 102 pay the copper and silver tiers.
    for height in 101..=102 {
        let (prevout, value) = builder.coinbase_outpoint(height - 51);
        let block = builder.next_pos(0x01, StakeSpec { prevout, value });
        node.state.accept_block(&block).expect("pos block");
    }

    // Height 103 owes the gold tier.
    assert_eq!(
        masternode_tier_for_height(103, &params),
        Some(MasternodeTier::Gold)
    );
    let payees = block_payees(103, &params);
    assert_eq!(payees.masternode, 1_000 * COIN);

    let mut tamper_builder = builder.clone();
    let (prevout, value) = tamper_builder.coinbase_outpoint(55);
    let mut bad = tamper_builder.next_pos(0x01, StakeSpec { prevout, value });
    {
        // Shave one coin off the masternode output; the shortfall goes
        // to the staker so only the payee split is wrong.
        let coinstake = &mut bad.transactions[1];
        let mn_output = coinstake
            .vout
            .iter()
            .position(|out| out.value == payees.masternode)
            .expect("masternode output");
        coinstake.vout[mn_output].value -= COIN;
        coinstake.vout[1].value += COIN;
    }
    reseal_tampered(&mut bad, &params);

    match node.state.accept_block(&bad) {
        Err(ChainStateError::Validation(ValidationError::Consensus(reason))) => {
            assert_eq!(reason, "masternode payment invalid");
        }
        other => panic!("expected consensus rejection, got {other:?}"),
    }
    assert_eq!(node.state.tip_height(), 102);

    // The honest block at the same height connects.
    let (prevout, value) = builder.coinbase_outpoint(55);
    let good = builder.next_pos(0x03, StakeSpec { prevout, value });
    node.state.accept_block(&good).expect("gold block");
    assert_eq!(node.state.tip_height(), 103);
}

/// Cycle payouts: the lottery and treasury outputs must be present at
/// their cycle heights.
#[test]
fn cycle_payouts_are_enforced() {
    let params = chain_params(Network::Regtest);
    let node = new_node(params.clone());
    let mut builder = ChainBuilder::from_genesis(&params);

    for _ in 1..=100 {
        let block = builder.next_pow(0x01);
        node.state.accept_block(&block).expect("pow block");
    }

    // Height 101 is a lottery payout height on regtest.
    let payees = block_payees(101, &params);
    assert!(payees.lottery > 0);

    let mut tamper_builder = builder.clone();
    let (prevout, value) = tamper_builder.coinbase_outpoint(50);
    let mut bad = tamper_builder.next_pos(0x01, StakeSpec { prevout, value });
    {
        let coinstake = &mut bad.transactions[1];
        let lottery_output = coinstake
            .vout
            .iter()
            .position(|out| out.value == payees.lottery)
            .expect("lottery output");
        coinstake.vout[lottery_output].value -= 1;
        coinstake.vout[1].value += 1;
    }
    reseal_tampered(&mut bad, &params);

    match node.state.accept_block(&bad) {
        Err(ChainStateError::Validation(ValidationError::Consensus(reason))) => {
            assert_eq!(reason, "lottery payment missing");
        }
        other => panic!("expected consensus rejection, got {other:?}"),
    }

    // Correct payouts connect, including the treasury block at 102.
    for height in 101..=102 {
        let (prevout, value) = builder.coinbase_outpoint(height - 51);
        let block = builder.next_pos(0x02, StakeSpec { prevout, value });
        node.state.accept_block(&block).expect("pos block");
    }
    assert_eq!(node.state.tip_height(), 102);

    let tip_entry = node
        .state
        .block_index_entry(&node.state.tip_hash().expect("tip"))
        .expect("entry");
    // Treasury block minted its lump payout on top of the producer and
    // masternode shares.
    let payees_102 = block_payees(102, &params);
    assert_eq!(tip_entry.mint, payees_102.total());
    assert!(payees_102.treasury > 0);
}
