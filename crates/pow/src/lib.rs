//! Proof-of-work checks and difficulty retargeting.

pub mod difficulty;

pub use difficulty::{
    bits_to_target, check_proof_of_work, compress_target, expand_compact, hash_below_target,
    next_work_required, target_to_bits, work_from_bits, BitsError, RetargetError, WindowEntry,
};
