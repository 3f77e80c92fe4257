//! Transaction merkle tree.

use izzy_consensus::Hash256;

use crate::hash::sha256d;

/// Root over `txids`, plus whether the tree is mutated by a duplicated
/// terminal pair (CVE-2012-2459 style malleation).
pub fn merkle_root_with_mutation(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && i2 + 1 == size && layer[i] == layer[i2] {
                mutated = true;
            }
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&layer[i]);
            data.extend_from_slice(&layer[i2]);
            next.push(sha256d(&data));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    merkle_root_with_mutation(txids).0
}
