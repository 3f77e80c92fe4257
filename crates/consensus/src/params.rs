//! Chain parameter definitions.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Main,
    Testnet,
    Regtest,
    Unittest,
    Betatest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
            Network::Unittest => "unittest",
            Network::Betatest => "betatest",
        }
    }
}

/// Resolves the command-line network selectors. At most one of the flags
/// may be set; none selects mainnet.
pub fn select_network(
    regtest: bool,
    testnet: bool,
    unittest: bool,
) -> Result<Network, &'static str> {
    match (regtest, testnet, unittest) {
        (false, false, false) => Ok(Network::Main),
        (true, false, false) => Ok(Network::Regtest),
        (false, true, false) => Ok(Network::Testnet),
        (false, false, true) => Ok(Network::Unittest),
        _ => Err("invalid combination of -regtest, -testnet and -unittest"),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MasternodeTier {
    Copper,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

pub const MASTERNODE_TIERS: [MasternodeTier; 5] = [
    MasternodeTier::Copper,
    MasternodeTier::Silver,
    MasternodeTier::Gold,
    MasternodeTier::Platinum,
    MasternodeTier::Diamond,
];

/// Collateral required to run a masternode of each tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MasternodeCollaterals {
    pub copper: Amount,
    pub silver: Amount,
    pub gold: Amount,
    pub platinum: Amount,
    pub diamond: Amount,
}

impl MasternodeCollaterals {
    pub fn for_tier(&self, tier: MasternodeTier) -> Amount {
        match tier {
            MasternodeTier::Copper => self.copper,
            MasternodeTier::Silver => self.silver,
            MasternodeTier::Gold => self.gold,
            MasternodeTier::Platinum => self.platinum,
            MasternodeTier::Diamond => self.diamond,
        }
    }

    pub fn tier_for_amount(&self, amount: Amount) -> Option<MasternodeTier> {
        MASTERNODE_TIERS
            .into_iter()
            .find(|tier| self.for_tier(*tier) == amount)
    }
}

const COLLATERALS_MAINNET: MasternodeCollaterals = MasternodeCollaterals {
    copper: 1_000_000 * COIN,
    silver: 3_000_000 * COIN,
    gold: 10_000_000 * COIN,
    platinum: 30_000_000 * COIN,
    diamond: 100_000_000 * COIN,
};

/* Masternode collaterals are significantly cheaper on regtest, so that it
   is easy to generate them in tests without having to mine hundreds of
   blocks. */
const COLLATERALS_REGTEST: MasternodeCollaterals = MasternodeCollaterals {
    copper: 100 * COIN,
    silver: 300 * COIN,
    gold: 1_000 * COIN,
    platinum: 3_000 * COIN,
    diamond: 10_000 * COIN,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentPos {
    TestDummy = 0,
    PosV2 = 1,
}

pub const MAX_VERSION_BITS_DEPLOYMENTS: usize = 2;

#[derive(Clone, Copy, Debug)]
pub struct Bip9Deployment {
    pub bit: u8,
    pub start_time: i64,
    pub timeout: i64,
    /// Retarget window length in blocks; state is constant per window.
    pub period: i32,
    /// Signalling blocks required within one window to lock in.
    pub threshold: i32,
}

impl Bip9Deployment {
    pub const ALWAYS_ACTIVE: i64 = -1;
    pub const NO_TIMEOUT: i64 = i64::MAX;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Copy, Debug)]
pub struct CheckpointData {
    /// UNIX timestamp of the last checkpoint block.
    pub last_checkpoint_time: i64,
    /// Transactions between genesis and the last checkpoint.
    pub total_transactions: u64,
    /// Estimated transactions per day after the last checkpoint.
    pub transactions_per_day: u64,
}

/// Inputs for rebuilding the genesis block from scratch.
#[derive(Clone, Copy, Debug)]
pub struct GenesisSeed {
    pub timestamp_text: &'static str,
    pub pubkey_hex: &'static str,
    pub coinbase_value: Amount,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub default_port: u16,

    pub pow_limit: Hash256,
    pub subsidy_halving_interval: i32,
    pub max_reorg_depth: i32,
    pub target_timespan: i64,
    pub target_spacing: i64,
    pub target_timespan_pos: i64,
    pub target_spacing_pos: i64,
    /// Coinbase and coinstake spendability delay in blocks.
    pub maturity: i32,
    pub max_money_out: Amount,
    pub premine: Amount,

    pub last_pow_height: i32,
    pub lottery_start_height: i32,
    pub lottery_cycle: i32,
    pub treasury_start_height: i32,
    pub treasury_cycle: i32,
    pub min_stake_age: i64,
    pub masternode_collaterals: MasternodeCollaterals,

    pub genesis: GenesisSeed,
    pub hash_genesis_block: Hash256,
    pub genesis_merkle_root: Hash256,

    pub base58_pubkey_prefix: u8,
    pub base58_script_prefix: u8,
    pub base58_secret_prefix: u8,
    pub dns_seeds: &'static [&'static str],

    pub mining_requires_peers: bool,
    pub allow_min_difficulty_blocks: bool,
    pub default_consistency_checks: bool,
    pub difficulty_retargeting: bool,
    pub mine_blocks_on_demand: bool,
    pub headers_first_syncing: bool,

    pub checkpoints: Vec<Checkpoint>,
    pub checkpoint_data: CheckpointData,
    pub deployments: [Bip9Deployment; MAX_VERSION_BITS_DEPLOYMENTS],
}

impl ChainParams {
    pub fn deployment(&self, pos: DeploymentPos) -> &Bip9Deployment {
        &self.deployments[pos as usize]
    }

    pub fn pow_retarget_interval(&self) -> i64 {
        self.target_timespan / self.target_spacing
    }

    pub fn pos_retarget_interval(&self) -> i64 {
        self.target_timespan_pos / self.target_spacing_pos
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|cp| cp.height)
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }

    /// Setters for the handful of fields unit tests vary. `None` on every
    /// network except unittest.
    pub fn modifiable(&mut self) -> Option<ModifiableParams<'_>> {
        if self.network != Network::Unittest {
            return None;
        }
        Some(ModifiableParams { params: self })
    }
}

pub struct ModifiableParams<'a> {
    params: &'a mut ChainParams,
}

impl ModifiableParams<'_> {
    pub fn set_subsidy_halving_interval(&mut self, interval: i32) {
        self.params.subsidy_halving_interval = interval;
    }

    pub fn set_default_consistency_checks(&mut self, enabled: bool) {
        self.params.default_consistency_checks = enabled;
    }

    pub fn set_allow_min_difficulty_blocks(&mut self, enabled: bool) {
        self.params.allow_min_difficulty_blocks = enabled;
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses display-order (big-endian) hex into the internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 || hex.len() % 2 == 1 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Main => main_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
        Network::Unittest => unittest_params(),
        Network::Betatest => betatest_params(),
    }
}

const GENESIS_PUBKEY: &str = "04913c14d2d588114b6973b0ab057cf2cbab9cfe9b80c182bad004de31f5968fbb4a5ae45bfb33f971e170ad9ad83f58e08de345f06fbdd50edde8d8dc4c792b80";

/// `~uint256(0) >> shift` in internal byte order.
fn pow_limit_shifted(shift: u32) -> Hash256 {
    let mut limit = [0xffu8; 32];
    let mut remaining = shift;
    let mut byte = 31usize;
    while remaining >= 8 {
        limit[byte] = 0;
        byte -= 1;
        remaining -= 8;
    }
    if remaining > 0 {
        limit[byte] >>= remaining;
    }
    limit
}

fn main_params() -> ChainParams {
    let hash_genesis_block =
        hash256_from_hex("0x000005ef45294f1265a15badef10d014c9b69c074d02a67dd93f8d6e87b80e07")
            .expect("mainnet genesis hash");
    ChainParams {
        network: Network::Main,
        message_start: [0x2b, 0x1c, 0x1e, 0x46],
        default_port: 31472,

        pow_limit: pow_limit_shifted(20),
        subsidy_halving_interval: 60 * 24 * 365,
        max_reorg_depth: 100,
        target_timespan: 10 * 60,
        target_spacing: 15,
        target_timespan_pos: 40 * 60,
        target_spacing_pos: 15,
        maturity: 20,
        max_money_out: 2_534_320_700 * COIN,
        premine: 2_000_000_000 * COIN,

        last_pow_height: 1_000,
        lottery_start_height: 1_001,
        lottery_cycle: 60 * 24 * 7,
        treasury_start_height: 1_001,
        treasury_cycle: 60 * 24 * 7 + 1,
        min_stake_age: 60,
        masternode_collaterals: COLLATERALS_MAINNET,

        genesis: GenesisSeed {
            timestamp_text:
                "Bosnia and Herzegovina Is Preparing a Draft Bill to Regulate Cryptocurrencies",
            pubkey_hex: GENESIS_PUBKEY,
            coinbase_value: 50 * COIN,
            version: 1,
            time: 1_621_007_898,
            bits: 0x1e0f_fff0,
            nonce: 110_471,
        },
        hash_genesis_block,
        genesis_merkle_root: hash256_from_hex(
            "0x4ee5d3d6c524152ea90feb8d14a815befe2870fc933b95995f1de0a802a7cc21",
        )
        .expect("mainnet genesis merkle root"),

        base58_pubkey_prefix: 43,
        base58_script_prefix: 48,
        base58_secret_prefix: 63,
        dns_seeds: &[
            "seeds1.izzyproject.org",
            "149.28.151.245",
            "45.77.252.245",
            "207.148.76.164",
            "139.180.129.56",
        ],

        mining_requires_peers: false,
        allow_min_difficulty_blocks: false,
        default_consistency_checks: false,
        difficulty_retargeting: true,
        mine_blocks_on_demand: false,
        headers_first_syncing: false,

        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash_genesis_block,
        }],
        checkpoint_data: CheckpointData {
            last_checkpoint_time: 1_538_069_980,
            total_transactions: 100,
            transactions_per_day: 2_000,
        },
        deployments: [
            Bip9Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
                period: 40,
                threshold: 30,
            },
            Bip9Deployment {
                bit: 0,
                start_time: 1_630_000_000,
                timeout: 1_661_536_000,
                period: 40,
                threshold: 30,
            },
        ],
    }
}

fn testnet_params() -> ChainParams {
    let mut params = main_params();
    params.network = Network::Testnet;
    params.message_start = [0xdf, 0xa0, 0x8d, 0x78];
    params.default_port = 31474;
    params.premine = 617_222_416 * COIN;
    params.subsidy_halving_interval = 1_000;
    params.target_timespan = 60;
    params.target_spacing = 60;
    params.maturity = 1;
    params.max_money_out = 2_535_000_000 * COIN;
    params.last_pow_height = 100;
    params.lottery_start_height = 101;
    params.lottery_cycle = 200;
    params.treasury_start_height = 102;
    params.treasury_cycle = 201;

    // Only time and nonce differ from the mainnet genesis, so the merkle
    // root carries over.
    params.genesis.time = 1_591_798_387;
    params.genesis.nonce = 2_282_642;
    params.hash_genesis_block =
        hash256_from_hex("0x00000b6fc8086cdb1afc1e5123ece5f0213aa35349a1e09b2341609a357ab0e4")
            .expect("testnet genesis hash");
    params.checkpoints = vec![Checkpoint {
        height: 0,
        hash: params.hash_genesis_block,
    }];
    params.checkpoint_data = CheckpointData {
        last_checkpoint_time: 1_537_971_708,
        total_transactions: 0,
        transactions_per_day: 250,
    };

    params.base58_pubkey_prefix = 139;
    params.base58_script_prefix = 19;
    params.base58_secret_prefix = 239;
    params.dns_seeds = &["autoseeds.tiviseed.izzyproject.org"];

    params.mining_requires_peers = true;
    params.allow_min_difficulty_blocks = true;

    params.deployments = [
        Bip9Deployment {
            bit: 28,
            start_time: 0,
            timeout: Bip9Deployment::NO_TIMEOUT,
            period: 100,
            threshold: 75,
        },
        Bip9Deployment {
            bit: 0,
            start_time: 1_600_000_000,
            timeout: Bip9Deployment::NO_TIMEOUT,
            period: 100,
            threshold: 75,
        },
    ];
    params
}

fn regtest_params() -> ChainParams {
    let mut params = testnet_params();
    params.network = Network::Regtest;
    params.message_start = [0xa1, 0xcf, 0x7e, 0xac];
    params.default_port = 31476;

    /* The premine on mainnet needs no tests, as it is "tested" by syncing
       on mainnet anyway. On regtest, it is easiest to not have a special
       premine, as it makes the generated coins more predictable. */
    params.premine = 1_250 * COIN;

    /* Add back a maturity period for coinbases as on mainnet, so that we
       can test this works as expected. */
    params.maturity = 20;

    params.subsidy_halving_interval = 100;
    params.target_timespan = 24 * 60 * 60;
    params.target_spacing = 60;
    params.pow_limit = pow_limit_shifted(1);
    params.genesis.time = 1_537_971_708;
    params.genesis.bits = 0x207f_ffff;
    params.genesis.nonce = 1_974_712;
    params.hash_genesis_block =
        hash256_from_hex("0x00000c4d0687728e0f261f2c446c68e67e55ce19c1c4fff521c471e0266c13dd")
            .expect("regtest genesis hash");
    params.checkpoints = vec![Checkpoint {
        height: 0,
        hash: params.hash_genesis_block,
    }];
    params.checkpoint_data = CheckpointData {
        last_checkpoint_time: 1_518_723_178,
        total_transactions: 0,
        transactions_per_day: 100,
    };

    params.lottery_start_height = 101;
    params.lottery_cycle = 10;
    params.treasury_start_height = 102;
    params.treasury_cycle = 50;

    /* There is no minimum coin age on regtest, so that we can easily
       generate PoS blocks as needed. */
    params.min_stake_age = 0;

    params.masternode_collaterals = COLLATERALS_REGTEST;
    params.dns_seeds = &[];

    params.mining_requires_peers = false;
    params.allow_min_difficulty_blocks = true;
    params.default_consistency_checks = true;
    params.difficulty_retargeting = false;
    params.mine_blocks_on_demand = true;

    params.deployments = [
        Bip9Deployment {
            bit: 28,
            start_time: 0,
            timeout: Bip9Deployment::NO_TIMEOUT,
            period: 144,
            threshold: 108,
        },
        Bip9Deployment {
            bit: 0,
            start_time: Bip9Deployment::ALWAYS_ACTIVE,
            timeout: Bip9Deployment::NO_TIMEOUT,
            period: 144,
            threshold: 108,
        },
    ];
    params
}

fn unittest_params() -> ChainParams {
    let mut params = main_params();
    params.network = Network::Unittest;
    params.default_port = 31478;
    params.dns_seeds = &[];

    params.mining_requires_peers = false;
    params.default_consistency_checks = true;
    params.allow_min_difficulty_blocks = false;
    params.difficulty_retargeting = true;
    params.mine_blocks_on_demand = true;

    params.deployments = [
        Bip9Deployment {
            bit: 28,
            start_time: 0,
            timeout: Bip9Deployment::NO_TIMEOUT,
            period: 144,
            threshold: 108,
        },
        Bip9Deployment {
            bit: 0,
            start_time: Bip9Deployment::ALWAYS_ACTIVE,
            timeout: Bip9Deployment::NO_TIMEOUT,
            period: 144,
            threshold: 108,
        },
    ];
    params
}

fn betatest_params() -> ChainParams {
    let mut params = main_params();
    params.network = Network::Betatest;
    params.message_start = [0xdf, 0xa0, 0x8d, 0x8a];
    params.premine = 2_534_320_700;
    params.subsidy_halving_interval = 1_000;
    params.target_timespan = 60;
    params.target_spacing = 60;
    params.maturity = 1;
    params.max_money_out = 2_535_000_000 * COIN;
    params.last_pow_height = 56_700;
    params.lottery_start_height = 100;
    params.lottery_cycle = 60 * 24 * 7;
    params.treasury_start_height = 100;
    params.treasury_cycle = 50;

    params.genesis = GenesisSeed {
        timestamp_text: "March 2, 2018 - East And West, Both Coasts Brace For Major Winter Storms",
        pubkey_hex: GENESIS_PUBKEY,
        coinbase_value: 8_000_250 * COIN,
        version: 1,
        time: 1_537_971_708,
        bits: 0x1e0f_fff0,
        nonce: 419_110_337,
    };
    params.hash_genesis_block =
        hash256_from_hex("0x000001b6db82e9f95f2d7c45d56d27d7e576894fd5fb2378456b7e35ff0c54b4")
            .expect("betatest genesis hash");
    params.genesis_merkle_root =
        hash256_from_hex("0xe50485528ac63bdf59722eaf8547f71f544f57ea35f704359868a7cb5ed7bb67")
            .expect("betatest genesis merkle root");
    params.checkpoints = vec![Checkpoint {
        height: 0,
        hash: params.hash_genesis_block,
    }];

    params.base58_pubkey_prefix = 30;
    params.base58_script_prefix = 13;
    params.base58_secret_prefix = 212;
    params.dns_seeds = &[];

    params.mining_requires_peers = true;
    params
}
