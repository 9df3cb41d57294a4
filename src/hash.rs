//! FNV-1a hashing
//!
//! Semantic state IDs and parameter name hashes are 32-bit FNV-1a values.
//! The compiler hashes a node's stable path; the engine hashes parameter
//! names. Both sides must agree bit-for-bit, so the function lives here and
//! nowhere else.

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte slice
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Hash a parameter name the way `set_param` / `ENV_GET` expect
#[inline]
pub fn hash_name(name: &str) -> u32 {
    fnv1a(name.as_bytes())
}

/// Fold one 32-bit word into a running FNV-1a hash, little-end first
///
/// Used for the program signature: the dag hash is FNV-1a over the sequence
/// of non-zero state IDs in instruction order.
#[inline]
pub fn fnv1a_fold_u32(mut h: u32, word: u32) -> u32 {
    for &b in &word.to_le_bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Starting value for an incremental FNV-1a hash
#[inline]
pub fn fnv1a_seed() -> u32 {
    FNV_OFFSET
}
