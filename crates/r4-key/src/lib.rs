#![forbid(unsafe_code)]
//! Key assignment.
//!
//! Builds the keys under which directory entries and stat-data are stored,
//! and converts keys to and from their compact object-id forms.
//!
//! ## Directory-entry keys
//!
//! ```text
//! large:  | dir oid:60 | 0:4 | fibre:7 | H:1 | name[0..7]:56 | name[7..15]:64 | name[15..23] or hash(name[15..]):64 |
//! small:  | dir oid:60 | 0:4 | fibre:7 | H:1 | name[0..7]:56 | name[7..15] or hash(name[7..]):64 |
//! ```
//!
//! `H` is the long-name mark. A short name is fully recoverable from its
//! key. A long name keeps a prefix verbatim and hashes the rest, so two long
//! names with a common prefix may collide; callers comparing entries must
//! check the stored name, not just the key.

pub mod codec;
pub mod fibration;
pub mod hash;

pub use codec::{is_longname, longname_prefix_len, pack_string, unpack_string};
pub use fibration::FibrationPolicy;
pub use hash::HashPolicy;

use r4_error::{R4Error, Result};
use r4_types::{DeId, Key, KeyFormat, KeyType, OID_MASK, ObjKeyId, ObjectId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::trace;

/// Long-name mark: bit 56 of the first name word.
pub const LONGNAME_MARK: u64 = 0x0100_0000_0000_0000;

/// Fibration bits plus the long-name mark: top byte of the first name word.
pub const FIBRATION_MASK: u64 = 0xff00_0000_0000_0000;

/// Naming policy of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirPolicy {
    pub hash: HashPolicy,
    pub fibration: FibrationPolicy,
}

/// Builds keys for one key format and directory policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyBuilder {
    format: KeyFormat,
    policy: DirPolicy,
}

impl KeyBuilder {
    #[must_use]
    pub fn new(format: KeyFormat, policy: DirPolicy) -> Self {
        Self { format, policy }
    }

    #[must_use]
    pub fn format(&self) -> KeyFormat {
        self.format
    }

    #[must_use]
    pub fn policy(&self) -> DirPolicy {
        self.policy
    }

    /// Key of entry `name` in the directory whose objectid is `dir_oid`.
    ///
    /// `"."` gets the all-zero entry key so it sorts first.
    #[must_use]
    pub fn build_entry_key(&self, dir_oid: ObjectId, name: &[u8]) -> Key {
        if name == b"." {
            return Key::new(dir_oid.0, KeyType::FileName, 0, 0, 0);
        }
        let fibre = self.policy.fibration.fibre(name);
        complete_entry_key(self.format, dir_oid.0, fibre, self.policy.hash, name)
    }

    /// Stat-data key of an object.
    #[must_use]
    pub fn build_sd_key(&self, locality: u64, ordering: u64, objectid: ObjectId) -> Key {
        build_sd_key(self.format, locality, ordering, objectid)
    }

    /// Ordering word an object created under `entry_key` inherits.
    #[must_use]
    pub fn object_ordering(&self, entry_key: &Key) -> u64 {
        match self.format {
            KeyFormat::Large => entry_key.ordering(),
            KeyFormat::Small => 0,
        }
    }
}

/// Fill the name words of a directory-entry key.
///
/// `fibre` must already be shifted into bits 57..=63.
#[must_use]
pub fn complete_entry_key(
    format: KeyFormat,
    dir_locality: u64,
    fibre: u64,
    hash: HashPolicy,
    name: &[u8],
) -> Key {
    let len = name.len();
    let key = match format {
        KeyFormat::Large => {
            let mut ordering = pack_string(name, 1);
            let mut objectid = 0;
            let mut offset = 0;
            if len > 7 {
                objectid = pack_string(&name[7..], 0);
                if len > 15 {
                    if len <= 23 {
                        offset = pack_string(&name[15..], 0);
                    } else {
                        offset = hash.hash(&name[15..]);
                        ordering |= LONGNAME_MARK;
                    }
                }
            }
            ordering |= fibre & !LONGNAME_MARK;
            Key::new(dir_locality, KeyType::FileName, ordering, objectid, offset)
        }
        KeyFormat::Small => {
            let mut objectid = pack_string(name, 1);
            let mut offset = 0;
            if len > 7 {
                if len <= 15 {
                    offset = pack_string(&name[7..], 0);
                } else {
                    offset = hash.hash(&name[7..]);
                    objectid |= LONGNAME_MARK;
                }
            }
            objectid |= fibre & !LONGNAME_MARK;
            Key::new(dir_locality, KeyType::FileName, 0, objectid, offset)
        }
    };
    trace!(len, long = is_longname(len, format), key = %key, "entry_key");
    key
}

#[must_use]
pub fn build_sd_key(format: KeyFormat, locality: u64, ordering: u64, objectid: ObjectId) -> Key {
    let ordering = match format {
        KeyFormat::Large => ordering,
        KeyFormat::Small => 0,
    };
    Key::new(locality, KeyType::StatData, ordering, objectid.0 & OID_MASK, 0)
}

/// Whether `key` is the entry key of `"."`.
#[must_use]
pub fn is_dot_key(key: &Key) -> bool {
    debug_assert_eq!(key.key_type(), KeyType::FileName);
    key.ordering() == 0 && key.objectid().0 == 0 && key.offset() == 0
}

/// Whether the entry key was built from a long (hashed) name.
#[must_use]
pub fn is_longname_key(key: &Key, format: KeyFormat) -> bool {
    let word = match format {
        KeyFormat::Large => key.ordering(),
        KeyFormat::Small => key.fulloid(),
    };
    word & LONGNAME_MARK != 0
}

/// Recover the name stored in a short-name entry key.
pub fn extract_name_from_key(key: &Key, format: KeyFormat) -> Result<Vec<u8>> {
    if is_longname_key(key, format) {
        return Err(R4Error::InvariantViolation(format!(
            "key {key} holds a hashed long name"
        )));
    }
    let mut name = extract_name_prefix(key, format);
    name.extend(unpack_string(key.offset()));
    Ok(name)
}

/// Name bytes stored verbatim in an entry key, hash excluded.
///
/// For a short name this is the name minus its offset-word part; for a long
/// name it is the full verbatim prefix.
#[must_use]
pub fn extract_name_prefix(key: &Key, format: KeyFormat) -> Vec<u8> {
    match format {
        KeyFormat::Large => {
            let mut name = unpack_string(key.ordering() & !FIBRATION_MASK);
            name.extend(unpack_string(key.fulloid()));
            name
        }
        KeyFormat::Small => unpack_string(key.fulloid() & !FIBRATION_MASK),
    }
}

/// Object identity of `key`. Type and offset are dropped.
#[must_use]
pub fn build_obj_key_id(key: &Key) -> ObjKeyId {
    ObjKeyId {
        locality: key.locality(),
        ordering: key.ordering(),
        fulloid: key.fulloid(),
    }
}

/// Inverse of [`build_obj_key_id`].
///
/// The id stores no type or offset; the returned key is a stat-data key at
/// offset 0, which callers adjust with [`Key::with_type`] and
/// [`Key::with_offset`].
#[must_use]
pub fn extract_key_from_id(id: &ObjKeyId) -> Key {
    Key::new(id.locality, KeyType::StatData, id.ordering, id.fulloid, 0)
}

/// Entry id of a directory-entry key.
#[must_use]
pub fn build_de_id(key: &Key) -> DeId {
    DeId {
        ordering: key.ordering(),
        fulloid: key.fulloid(),
        offset: key.offset(),
    }
}

/// Rebuild an entry key from its id and the directory's objectid.
#[must_use]
pub fn extract_key_from_de_id(dir_locality: u64, id: &DeId) -> Key {
    Key::new(dir_locality, KeyType::FileName, id.ordering, id.fulloid, id.offset)
}

/// Compare an entry id with an entry key of the same directory.
#[must_use]
pub fn de_id_cmp(id: &DeId, key: &Key) -> Ordering {
    (id.ordering, id.fulloid, id.offset).cmp(&(key.ordering(), key.fulloid(), key.offset()))
}
