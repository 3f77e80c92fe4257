//! Monetary units.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

pub fn money_range(value: Amount, max_money_out: Amount) -> bool {
    (0..=max_money_out).contains(&value)
}
