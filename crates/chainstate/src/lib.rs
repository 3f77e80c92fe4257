//! Consensus chain state: block tree, coin views, validation and the
//! activation machinery.

pub mod addressindex;
pub mod blockfiles;
pub mod coins;
pub mod coinsdb;
pub mod manager;
pub mod spentindex;
pub mod treedb;
pub mod tree;
pub mod txindex;
pub mod undo;
pub mod validation;
pub mod versionbits;

pub use manager::{ChainState, ChainStateConfig, ChainStateError, FlushMode};
pub use validation::ValidationError;
