//! Chain parameters, money rules and the reward schedule.

pub mod money;
pub mod params;
pub mod subsidy;

pub use money::{Amount, COIN, CENT};
pub use params::{
    chain_params, hash256_from_hex, select_network, Bip9Deployment, ChainParams, Checkpoint,
    DeploymentPos, MasternodeTier, ModifiableParams, Network, GenesisSeed,
    MAX_VERSION_BITS_DEPLOYMENTS,
};
pub use subsidy::{block_payees, block_subsidy, BlockPayees};

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
