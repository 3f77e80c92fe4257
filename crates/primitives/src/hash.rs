//! Hash helpers over the byte-level consensus formats.

use izzy_consensus::Hash256;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    digest.into()
}

/// Double SHA-256, the block/transaction hash of the wire format.
pub fn sha256d(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), used for address hashes.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    ripe.into()
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
