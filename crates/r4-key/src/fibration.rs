//! Fibration: a small bucket number mixed into the top bits of the first
//! name word so that entries of one kind sort together inside a directory.

use serde::{Deserialize, Serialize};

/// Fibre numbers occupy bits 57..=63.
pub const FIBRE_SHIFT: u32 = 57;

#[must_use]
pub fn fibre_no(n: u64) -> u64 {
    n << FIBRE_SHIFT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FibrationPolicy {
    /// Pure name order.
    #[default]
    Lexicographic,
    /// Object files (`*.o`) after everything else.
    DotO,
    /// Group by one-character extension.
    Ext1,
    /// Group by three-character extension.
    Ext3,
}

impl FibrationPolicy {
    /// Fibre bits for `name`, already shifted into position.
    #[must_use]
    pub fn fibre(self, name: &[u8]) -> u64 {
        let len = name.len();
        match self {
            Self::Lexicographic => fibre_no(0),
            Self::DotO => {
                if len > 2 && name[len - 1] == b'o' && name[len - 2] == b'.' {
                    fibre_no(1)
                } else {
                    fibre_no(0)
                }
            }
            Self::Ext1 => {
                if len > 2 && name[len - 2] == b'.' {
                    fibre_no(u64::from(name[len - 1]))
                } else {
                    fibre_no(0)
                }
            }
            Self::Ext3 => {
                if len > 4 && name[len - 4] == b'.' {
                    let sum = u64::from(name[len - 3])
                        + u64::from(name[len - 2])
                        + u64::from(name[len - 1]);
                    fibre_no(sum)
                } else {
                    fibre_no(0)
                }
            }
        }
    }
}
