//! Hash policies for the tail of long directory-entry names.

use serde::{Deserialize, Serialize};

/// Value returned by [`HashPolicy::Degenerate`] for every name.
pub const DEGENERATE_HASH: u64 = 0xc0c0_c0c0_1010_1010;

const FNV1_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Per-directory choice of name hash. Hashes are pure functions of the
/// name bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashPolicy {
    #[default]
    R5,
    Fnv1,
    /// Every name hashes to the same value. Forces collisions.
    Degenerate,
}

impl HashPolicy {
    #[must_use]
    pub fn hash(self, name: &[u8]) -> u64 {
        match self {
            Self::R5 => r5_hash(name),
            Self::Fnv1 => fnv1_hash(name),
            Self::Degenerate => DEGENERATE_HASH,
        }
    }
}

#[must_use]
pub fn r5_hash(name: &[u8]) -> u64 {
    name.iter().fold(0_u64, |acc, &byte| {
        let byte = u64::from(byte);
        acc.wrapping_add(byte << 4)
            .wrapping_add(byte >> 4)
            .wrapping_mul(11)
    })
}

#[must_use]
pub fn fnv1_hash(name: &[u8]) -> u64 {
    name.iter().fold(FNV1_OFFSET_BASIS, |acc, &byte| {
        acc.wrapping_mul(FNV1_PRIME) ^ u64::from(byte)
    })
}
