//! Consensus serialization and the block/transaction primitives.

pub mod block;
pub mod encoding;
pub mod genesis;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
