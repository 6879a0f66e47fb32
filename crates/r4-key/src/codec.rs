//! Portable packing of name bytes into 64-bit key words.
//!
//! Bytes are shifted in one at a time, first byte most significant, so the
//! numeric order of packed words follows the byte order of the names. A
//! struct copy of the name into the word would depend on host endianness and
//! is not used.

use r4_types::KeyFormat;

/// Pack up to `8 - start_idx` bytes of `name` into a word.
///
/// The first `start_idx` high bytes stay zero (they carry fibration and the
/// long-name mark in the first name word). Unused low bytes are zero.
#[must_use]
pub fn pack_string(name: &[u8], start_idx: usize) -> u64 {
    debug_assert!(start_idx < 8);
    let room = 8 - start_idx;
    let mut word = 0_u64;
    let mut packed = 0_usize;
    for &byte in name.iter().take(room) {
        word = (word << 8) | u64::from(byte);
        packed += 1;
    }
    let pad = 8 - packed - start_idx;
    if pad < 8 { word << (pad * 8) } else { 0 }
}

/// Inverse of [`pack_string`]: the non-zero bytes of `value`, most
/// significant first.
///
/// Zero bytes are skipped, which drops the cleared fibration byte in front
/// and the padding behind. Names containing NUL do not round-trip.
#[must_use]
pub fn unpack_string(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    while value != 0 {
        let byte = value.to_be_bytes()[0];
        if byte != 0 {
            out.push(byte);
        }
        value <<= 8;
    }
    out
}

/// Whether a name of `len` bytes cannot be stored in a key verbatim.
#[must_use]
pub fn is_longname(len: usize, format: KeyFormat) -> bool {
    len > format.name_threshold()
}

/// Number of leading name bytes kept verbatim in a long-name key; the rest
/// is represented by a hash.
#[must_use]
pub fn longname_prefix_len(format: KeyFormat) -> usize {
    match format {
        KeyFormat::Large => 15,
        KeyFormat::Small => 7,
    }
}
