//! Compact difficulty targets, block work and retargeting.

use izzy_consensus::{ChainParams, Hash256};
use primitive_types::U256;

/// Failure to expand a compact difficulty encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitsError {
    SignBitSet,
    TargetTooWide,
}

impl std::fmt::Display for BitsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BitsError::SignBitSet => write!(f, "compact bits encode a negative target"),
            BitsError::TargetTooWide => write!(f, "compact bits exceed the 256-bit range"),
        }
    }
}

impl std::error::Error for BitsError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetargetError {
    NoHeaders,
    WindowGap,
    WindowTooShort,
    Bits(BitsError),
}

impl std::fmt::Display for RetargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetargetError::NoHeaders => write!(f, "no headers in difficulty window"),
            RetargetError::WindowGap => write!(f, "difficulty window has a height gap"),
            RetargetError::WindowTooShort => {
                write!(f, "difficulty window does not cover the retarget interval")
            }
            RetargetError::Bits(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RetargetError {}

impl From<BitsError> for RetargetError {
    fn from(err: BitsError) -> Self {
        RetargetError::Bits(err)
    }
}

/// One header of the retarget window, oldest first.
#[derive(Clone, Copy, Debug)]
pub struct WindowEntry {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

/// Expands the 4-byte exponent/mantissa form into a full target.
pub fn expand_compact(bits: u32) -> Result<U256, BitsError> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 {
        return Err(BitsError::SignBitSet);
    }

    let target = if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from(mantissa) << (8 * (exponent - 3) as usize)
    };

    if mantissa != 0 {
        let too_wide = exponent > 34
            || (exponent > 33 && mantissa > 0xff)
            || (exponent > 32 && mantissa > 0xffff);
        if too_wide {
            return Err(BitsError::TargetTooWide);
        }
    }

    Ok(target)
}

/// Inverse of [`expand_compact`]: keeps the top three mantissa bytes and
/// bumps the exponent when the sign bit would be hit.
pub fn compress_target(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let mut exponent = (target.bits() + 7) / 8;
    let mut mantissa = if exponent <= 3 {
        target.low_u32() << (8 * (3 - exponent))
    } else {
        (target >> (8 * (exponent - 3))).low_u32()
    };

    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }

    ((exponent as u32) << 24) | (mantissa & 0x007f_ffff)
}

pub fn bits_to_target(bits: u32) -> Result<Hash256, BitsError> {
    Ok(expand_compact(bits)?.to_little_endian())
}

pub fn target_to_bits(target: &Hash256) -> u32 {
    compress_target(U256::from_little_endian(target))
}

pub fn hash_below_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Work a block at this difficulty contributes to the chain:
/// `floor(2^256 / (target + 1))`, computed without 257-bit arithmetic
/// through the usual `(~target / (target + 1)) + 1` identity.
pub fn work_from_bits(bits: u32) -> Result<U256, BitsError> {
    let target = expand_compact(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    Ok((!target / (target + U256::one())) + U256::one())
}

/// Checks `hash <= target(bits)` with `bits` inside the network's proof
/// of work range.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, params: &ChainParams) -> bool {
    let target = match expand_compact(bits) {
        Ok(target) => target,
        Err(_) => return false,
    };
    if target.is_zero() {
        return false;
    }
    let limit = U256::from_little_endian(&params.pow_limit);
    if target > limit {
        return false;
    }
    U256::from_little_endian(hash) <= target
}

/// Computes the compact difficulty the block after `window.last()` must
/// carry.
///
/// `window` holds the most recent headers, contiguous by height,
/// covering at least the current retarget span. The PoW and PoS phases
/// each use their own timespan/spacing; the adjustment is clamped to a
/// factor of four per retarget and bounded by the proof-of-work limit.
pub fn next_work_required(
    window: &[WindowEntry],
    params: &ChainParams,
    next_block_time: Option<i64>,
) -> Result<u32, RetargetError> {
    let pow_limit_bits = target_to_bits(&params.pow_limit);
    let last = match window.last() {
        Some(last) => last,
        None => return Ok(pow_limit_bits),
    };
    check_window(window)?;

    // Networks without retargeting keep the difficulty they started with.
    if !params.difficulty_retargeting {
        return Ok(last.bits);
    }

    let next_height = last.height + 1;
    let pos_phase = next_height > params.last_pow_height as i64;
    let (timespan, spacing) = if pos_phase {
        (params.target_timespan_pos, params.target_spacing_pos)
    } else {
        (params.target_timespan, params.target_spacing)
    };
    let interval = timespan / spacing;

    if params.allow_min_difficulty_blocks {
        // A block more than two spacings late may fall back to the
        // minimum difficulty.
        if let Some(next_time) = next_block_time {
            if next_time > last.time + spacing * 2 {
                return Ok(pow_limit_bits);
            }
        }
    }

    if next_height % interval != 0 {
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    if first_height < 0 {
        return Ok(pow_limit_bits);
    }
    let first_offset = first_height - window[0].height;
    if first_offset < 0 {
        return Err(RetargetError::WindowTooShort);
    }
    let first = &window[first_offset as usize];

    let mut actual_timespan = last.time - first.time;
    if actual_timespan < timespan / 4 {
        actual_timespan = timespan / 4;
    }
    if actual_timespan > timespan * 4 {
        actual_timespan = timespan * 4;
    }

    let old_target = expand_compact(last.bits)?;
    let (scaled, overflowed) = old_target.overflowing_mul(U256::from(actual_timespan as u64));
    let mut new_target = if overflowed {
        U256::MAX
    } else {
        scaled / U256::from(timespan as u64)
    };
    let limit = U256::from_little_endian(&params.pow_limit);
    if new_target > limit {
        new_target = limit;
    }
    Ok(compress_target(new_target))
}

fn check_window(window: &[WindowEntry]) -> Result<(), RetargetError> {
    if window.is_empty() {
        return Err(RetargetError::NoHeaders);
    }
    let base = window[0].height;
    for (offset, entry) in window.iter().enumerate() {
        if entry.height != base + offset as i64 {
            return Err(RetargetError::WindowGap);
        }
    }
    Ok(())
}
