//! Parity computation over 8-byte entries
//!
//! A parity is the XOR of database entries at a set of indices. The server
//! answers a FullSet query with the parity of the expanded set; the client
//! recomputes the same parity from its hint.

use crate::ENTRY_SIZE;

/// Compute the XOR parity of the entries at the given indices
pub fn compute_parity<I, F>(indices: I, get_entry: F) -> u64
where
    I: IntoIterator<Item = u64>,
    F: Fn(u64) -> u64,
{
    indices.into_iter().fold(0u64, |parity, idx| parity ^ get_entry(idx))
}

/// Delta that turns `old_value` into `new_value` when XORed in
///
/// Applying the same delta twice restores `old_value`.
#[inline]
pub fn delta_value(old_value: u64, new_value: u64) -> u64 {
    old_value ^ new_value
}

/// XOR the little-endian encoding of `value` into an 8-byte slot
#[inline]
pub fn xor_into(dst: &mut [u8; ENTRY_SIZE], value: u64) {
    for (d, s) in dst.iter_mut().zip(value.to_le_bytes()) {
        *d ^= s;
    }
}
