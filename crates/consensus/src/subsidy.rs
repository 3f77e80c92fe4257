//! Block reward schedule: premine, PoW/PoS producer rewards and the
//! treasury/lottery/masternode payment cycles.

use crate::money::{Amount, COIN};
use crate::params::{ChainParams, MasternodeTier, MASTERNODE_TIERS};

/// Flat reward before the halving schedule bites.
pub const BASE_BLOCK_SUBSIDY: Amount = 1_250 * COIN;

/// Per-block accrual paid out in one lump at each lottery cycle boundary.
pub const LOTTERY_ACCRUAL: Amount = 50 * COIN;

/// Per-block accrual paid out in one lump at each treasury cycle boundary.
pub const TREASURY_ACCRUAL: Amount = 100 * COIN;

/// Total new money a block at `height` may create, before fees and the
/// scheduled cycle payouts.
pub fn block_subsidy(height: i32, params: &ChainParams) -> Amount {
    if height <= 0 {
        return 0;
    }
    if height == 1 {
        return params.premine;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    BASE_BLOCK_SUBSIDY >> halvings
}

pub fn is_lottery_height(height: i32, params: &ChainParams) -> bool {
    height >= params.lottery_start_height
        && (height - params.lottery_start_height) % params.lottery_cycle == 0
}

pub fn is_treasury_height(height: i32, params: &ChainParams) -> bool {
    height >= params.treasury_start_height
        && (height - params.treasury_start_height) % params.treasury_cycle == 0
}

pub fn lottery_payment(height: i32, params: &ChainParams) -> Amount {
    if is_lottery_height(height, params) {
        LOTTERY_ACCRUAL * params.lottery_cycle as Amount
    } else {
        0
    }
}

pub fn treasury_payment(height: i32, params: &ChainParams) -> Amount {
    if is_treasury_height(height, params) {
        TREASURY_ACCRUAL * params.treasury_cycle as Amount
    } else {
        0
    }
}

/// The tier whose masternode is paid at `height`, rotating through the
/// tiers from the first PoS block on.
pub fn masternode_tier_for_height(height: i32, params: &ChainParams) -> Option<MasternodeTier> {
    if height <= params.last_pow_height {
        return None;
    }
    let offset = (height - params.last_pow_height - 1) % MASTERNODE_TIERS.len() as i32;
    Some(MASTERNODE_TIERS[offset as usize])
}

/// Expected payees of a block at `height`, fees excluded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockPayees {
    /// Miner or staker reward.
    pub producer: Amount,
    /// Lottery pool payout; zero off cycle boundaries.
    pub lottery: Amount,
    /// Treasury payout; zero off cycle boundaries.
    pub treasury: Amount,
    /// Masternode payment, equal to the due tier's collateral.
    pub masternode: Amount,
    pub masternode_tier: Option<MasternodeTier>,
}

impl BlockPayees {
    pub fn total(&self) -> Amount {
        self.producer + self.lottery + self.treasury + self.masternode
    }
}

pub fn block_payees(height: i32, params: &ChainParams) -> BlockPayees {
    let subsidy = block_subsidy(height, params);

    let mut producer = subsidy;
    if height > 1 {
        // The pool accruals come out of the producer's share once the
        // respective cycle has started.
        if height >= params.lottery_start_height {
            producer -= LOTTERY_ACCRUAL.min(producer);
        }
        if height >= params.treasury_start_height {
            producer -= TREASURY_ACCRUAL.min(producer);
        }
    }

    let masternode_tier = masternode_tier_for_height(height, params);
    let masternode = masternode_tier
        .map(|tier| params.masternode_collaterals.for_tier(tier))
        .unwrap_or(0);

    BlockPayees {
        producer,
        lottery: lottery_payment(height, params),
        treasury: treasury_payment(height, params),
        masternode,
        masternode_tier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn premine_only_at_height_one() {
        let params = chain_params(Network::Main);
        assert_eq!(block_subsidy(1, &params), params.premine);
        assert_eq!(block_subsidy(2, &params), BASE_BLOCK_SUBSIDY);
        assert_eq!(block_subsidy(0, &params), 0);
    }

    #[test]
    fn subsidy_halves_on_schedule() {
        let mut params = chain_params(Network::Unittest);
        params
            .modifiable()
            .expect("unittest")
            .set_subsidy_halving_interval(100);
        assert_eq!(block_subsidy(99, &params), BASE_BLOCK_SUBSIDY);
        assert_eq!(block_subsidy(100, &params), BASE_BLOCK_SUBSIDY / 2);
        assert_eq!(block_subsidy(200, &params), BASE_BLOCK_SUBSIDY / 4);
        assert_eq!(block_subsidy(6_400, &params), 0);
    }

    #[test]
    fn lottery_and_treasury_cycles() {
        let params = chain_params(Network::Regtest);
        // Regtest: lottery starts at 101 with cycle 10, treasury at 102
        // with cycle 50.
        assert!(is_lottery_height(101, &params));
        assert!(!is_lottery_height(102, &params));
        assert!(is_lottery_height(111, &params));
        assert_eq!(
            lottery_payment(111, &params),
            LOTTERY_ACCRUAL * params.lottery_cycle as Amount
        );
        assert_eq!(lottery_payment(112, &params), 0);

        assert!(is_treasury_height(102, &params));
        assert!(is_treasury_height(152, &params));
        assert!(!is_treasury_height(103, &params));
        assert_eq!(
            treasury_payment(102, &params),
            TREASURY_ACCRUAL * params.treasury_cycle as Amount
        );
    }

    #[test]
    fn masternode_tier_rotation() {
        let params = chain_params(Network::Regtest);
        assert_eq!(masternode_tier_for_height(100, &params), None);
        assert_eq!(
            masternode_tier_for_height(101, &params),
            Some(MasternodeTier::Copper)
        );
        assert_eq!(
            masternode_tier_for_height(103, &params),
            Some(MasternodeTier::Gold)
        );
        assert_eq!(
            masternode_tier_for_height(105, &params),
            Some(MasternodeTier::Diamond)
        );
        assert_eq!(
            masternode_tier_for_height(106, &params),
            Some(MasternodeTier::Copper)
        );
    }

    #[test]
    fn payees_split_the_subsidy() {
        let params = chain_params(Network::Regtest);
        let payees = block_payees(103, &params);
        assert_eq!(payees.masternode_tier, Some(MasternodeTier::Gold));
        assert_eq!(payees.masternode, 1_000 * COIN);
        assert_eq!(payees.lottery, 0);
        assert_eq!(payees.treasury, 0);
        // Height 103: one halving (interval 100), minus both accruals.
        assert_eq!(
            payees.producer,
            BASE_BLOCK_SUBSIDY / 2 - LOTTERY_ACCRUAL - TREASURY_ACCRUAL
        );

        let boundary = block_payees(111, &params);
        assert_eq!(
            boundary.lottery,
            LOTTERY_ACCRUAL * params.lottery_cycle as Amount
        );
    }
}
