#![forbid(unsafe_code)]
//! Tree key layout and object identities.
//!
//! Every item in the tree is addressed by a [`Key`]. Keys are a fixed tuple
//! of 64-bit words that compare word by word:
//!
//! ```text
//! large keys (4 words):
//!   | locality:60 | type:4 | ordering:64 | band:4 | objectid:60 | offset:64 |
//! small keys (3 words):
//!   | locality:60 | type:4 |               band:4 | objectid:60 | offset:64 |
//! ```
//!
//! The second word of a large key (and the objectid word of a small key) is
//! reused by directory entries to hold packed name characters, so the
//! objectid word is kept whole here as `fulloid`.

use r4_error::R4Error;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Largest value representable in the 60-bit locality/objectid fields.
pub const OID_MASK: u64 = (1_u64 << 60) - 1;

/// Band bits live above the 60-bit objectid.
pub const BAND_SHIFT: u32 = 60;

/// Size of one on-disk key word.
pub const KEY_WORD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key size configuration of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// Four-word keys with a separate ordering word.
    #[default]
    Large,
    /// Three-word keys, no ordering word.
    Small,
}

impl KeyFormat {
    /// Number of 64-bit words in an on-disk key.
    #[must_use]
    pub fn key_words(self) -> usize {
        match self {
            Self::Large => 4,
            Self::Small => 3,
        }
    }

    /// On-disk key size in bytes.
    #[must_use]
    pub fn key_size(self) -> usize {
        self.key_words() * KEY_WORD_SIZE
    }

    /// Longest name that is stored in a key without hashing.
    #[must_use]
    pub fn name_threshold(self) -> usize {
        match self {
            Self::Large => 23,
            Self::Small => 15,
        }
    }
}

/// Minor locality: the 4-bit type discriminant of a key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum KeyType {
    FileName = 0,
    #[default]
    StatData = 1,
    AttrName = 2,
    AttrBody = 3,
    Body = 4,
}

impl KeyType {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::FileName),
            1 => Ok(Self::StatData),
            2 => Ok(Self::AttrName),
            3 => Ok(Self::AttrBody),
            4 => Ok(Self::Body),
            _ => Err(ParseError::InvalidField {
                field: "key_type",
                reason: "unknown minor locality",
            }),
        }
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// A tree key.
///
/// Field declaration order is the comparison order, which matches the
/// on-disk word order because `locality` is bounded to 60 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    locality: u64,
    key_type: KeyType,
    ordering: u64,
    fulloid: u64,
    offset: u64,
}

impl Key {
    /// Smallest possible key.
    pub const MIN: Self = Self {
        locality: 0,
        key_type: KeyType::FileName,
        ordering: 0,
        fulloid: 0,
        offset: 0,
    };

    /// Largest possible key.
    pub const MAX: Self = Self {
        locality: OID_MASK,
        key_type: KeyType::Body,
        ordering: u64::MAX,
        fulloid: u64::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(locality: u64, key_type: KeyType, ordering: u64, fulloid: u64, offset: u64) -> Self {
        Self {
            locality: locality & OID_MASK,
            key_type,
            ordering,
            fulloid,
            offset,
        }
    }

    /// Key of byte `offset` in the body of object `objectid`.
    #[must_use]
    pub fn body(locality: u64, ordering: u64, objectid: ObjectId, offset: u64) -> Self {
        Self::new(locality, KeyType::Body, ordering, objectid.0 & OID_MASK, offset)
    }

    #[must_use]
    pub fn locality(&self) -> u64 {
        self.locality
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn ordering(&self) -> u64 {
        self.ordering
    }

    /// The whole objectid word, band bits included.
    #[must_use]
    pub fn fulloid(&self) -> u64 {
        self.fulloid
    }

    #[must_use]
    pub fn objectid(&self) -> ObjectId {
        ObjectId(self.fulloid & OID_MASK)
    }

    #[must_use]
    pub fn band(&self) -> u8 {
        // Four bits after the shift.
        #[expect(clippy::cast_possible_truncation)]
        let band = (self.fulloid >> BAND_SHIFT) as u8;
        band
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    #[must_use]
    pub fn with_ordering(mut self, ordering: u64) -> Self {
        self.ordering = ordering;
        self
    }

    #[must_use]
    pub fn with_fulloid(mut self, fulloid: u64) -> Self {
        self.fulloid = fulloid;
        self
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Whether both keys address the same item stream of the same object:
    /// everything but the offset is equal.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        self.locality == other.locality
            && self.key_type == other.key_type
            && self.ordering == other.ordering
            && self.fulloid == other.fulloid
    }

    /// First word of the on-disk encoding.
    #[must_use]
    pub fn el0(&self) -> u64 {
        (self.locality << 4) | u64::from(self.key_type.raw())
    }

    /// Compare keys as the given format stores them. Small keys have no
    /// ordering word, so ordering never participates.
    #[must_use]
    pub fn cmp_in(&self, other: &Self, format: KeyFormat) -> Ordering {
        match format {
            KeyFormat::Large => self.cmp(other),
            KeyFormat::Small => (self.el0(), self.fulloid, self.offset).cmp(&(
                other.el0(),
                other.fulloid,
                other.offset,
            )),
        }
    }

    /// Encode as little-endian key words.
    #[must_use]
    pub fn encode(&self, format: KeyFormat) -> Vec<u8> {
        let mut out = Vec::with_capacity(format.key_size());
        out.extend_from_slice(&self.el0().to_le_bytes());
        if format == KeyFormat::Large {
            out.extend_from_slice(&self.ordering.to_le_bytes());
        }
        out.extend_from_slice(&self.fulloid.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decode a key written by [`Key::encode`].
    pub fn decode(data: &[u8], format: KeyFormat) -> Result<Self, ParseError> {
        let el0 = read_le_u64(data, 0)?;
        // Low four bits hold the type.
        #[expect(clippy::cast_possible_truncation)]
        let key_type = KeyType::from_raw((el0 & 0xf) as u8)?;
        let (ordering, rest) = match format {
            KeyFormat::Large => (read_le_u64(data, KEY_WORD_SIZE)?, 2 * KEY_WORD_SIZE),
            KeyFormat::Small => (0, KEY_WORD_SIZE),
        };
        Ok(Self {
            locality: el0 >> 4,
            key_type,
            ordering,
            fulloid: read_le_u64(data, rest)?,
            offset: read_le_u64(data, rest + KEY_WORD_SIZE)?,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:x}:{:x}:{:x}:{:x}:{:x})",
            self.locality,
            self.key_type.raw(),
            self.ordering,
            self.fulloid,
            self.offset
        )
    }
}

/// Object identity projection of a key: locality, ordering and objectid.
///
/// Type and offset are not part of object identity and are not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjKeyId {
    pub locality: u64,
    pub ordering: u64,
    pub fulloid: u64,
}

impl ObjKeyId {
    /// On-disk size for the given key format.
    #[must_use]
    pub fn size(format: KeyFormat) -> usize {
        (format.key_words() - 1) * KEY_WORD_SIZE
    }

    #[must_use]
    pub fn encode(&self, format: KeyFormat) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::size(format));
        out.extend_from_slice(&self.locality.to_le_bytes());
        if format == KeyFormat::Large {
            out.extend_from_slice(&self.ordering.to_le_bytes());
        }
        out.extend_from_slice(&self.fulloid.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8], format: KeyFormat) -> Result<Self, ParseError> {
        let locality = read_le_u64(data, 0)?;
        match format {
            KeyFormat::Large => Ok(Self {
                locality,
                ordering: read_le_u64(data, KEY_WORD_SIZE)?,
                fulloid: read_le_u64(data, 2 * KEY_WORD_SIZE)?,
            }),
            KeyFormat::Small => Ok(Self {
                locality,
                ordering: 0,
                fulloid: read_le_u64(data, KEY_WORD_SIZE)?,
            }),
        }
    }
}

/// Directory-entry id: a file-name key without its locality, which is
/// implied by the containing directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeId {
    pub ordering: u64,
    pub fulloid: u64,
    pub offset: u64,
}

impl DeId {
    #[must_use]
    pub fn size(format: KeyFormat) -> usize {
        (format.key_words() - 1) * KEY_WORD_SIZE
    }

    #[must_use]
    pub fn encode(&self, format: KeyFormat) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::size(format));
        if format == KeyFormat::Large {
            out.extend_from_slice(&self.ordering.to_le_bytes());
        }
        out.extend_from_slice(&self.fulloid.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8], format: KeyFormat) -> Result<Self, ParseError> {
        let (ordering, rest) = match format {
            KeyFormat::Large => (read_le_u64(data, 0)?, KEY_WORD_SIZE),
            KeyFormat::Small => (0, 0),
        };
        Ok(Self {
            ordering,
            fulloid: read_le_u64(data, rest)?,
            offset: read_le_u64(data, rest + KEY_WORD_SIZE)?,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<ParseError> for R4Error {
    fn from(err: ParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut word = [0_u8; 8];
    word.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Key {
        Key::new(0x2a, KeyType::Body, 0x1122, 0x10_0000_0000_0000 | 77, 4096)
    }

    #[test]
    fn key_encode_decode_large() {
        let key = sample();
        let bytes = key.encode(KeyFormat::Large);
        assert_eq!(bytes.len(), 32);
        assert_eq!(Key::decode(&bytes, KeyFormat::Large).unwrap(), key);
    }

    #[test]
    fn small_format_drops_ordering() {
        let key = sample();
        let bytes = key.encode(KeyFormat::Small);
        assert_eq!(bytes.len(), 24);
        let back = Key::decode(&bytes, KeyFormat::Small).unwrap();
        assert_eq!(back.ordering(), 0);
        assert_eq!(back, key.with_ordering(0));
    }

    #[test]
    fn first_word_packs_locality_and_type() {
        let key = Key::new(5, KeyType::StatData, 0, 9, 0);
        assert_eq!(key.el0(), (5 << 4) | 1);
        let bytes = key.encode(KeyFormat::Large);
        assert_eq!(read_le_u64(&bytes, 0).unwrap(), 0x51);
    }

    #[test]
    fn derived_order_matches_word_order() {
        let a = Key::new(1, KeyType::Body, 0, 5, 100);
        let b = Key::new(1, KeyType::Body, 0, 5, 101);
        let c = Key::new(1, KeyType::Body, 0, 6, 0);
        let d = Key::new(2, KeyType::FileName, 0, 0, 0);
        assert!(a < b && b < c && c < d);
        assert!(Key::new(1, KeyType::StatData, 0, 5, 0) < a);
        assert!(Key::MIN < a && a < Key::MAX);
    }

    #[test]
    fn small_compare_ignores_ordering() {
        let a = Key::new(1, KeyType::Body, 9, 5, 0);
        let b = Key::new(1, KeyType::Body, 1, 5, 0);
        assert_eq!(a.cmp_in(&b, KeyFormat::Small), Ordering::Equal);
        assert_eq!(a.cmp_in(&b, KeyFormat::Large), Ordering::Greater);
    }

    #[test]
    fn band_and_objectid_split_fulloid() {
        let key = Key::new(1, KeyType::Body, 0, (3_u64 << BAND_SHIFT) | 42, 0);
        assert_eq!(key.band(), 3);
        assert_eq!(key.objectid(), ObjectId(42));
    }

    #[test]
    fn unknown_key_type_rejected() {
        let mut bytes = sample().encode(KeyFormat::Large);
        bytes[0] = (bytes[0] & 0xf0) | 0x0f;
        assert!(matches!(
            Key::decode(&bytes, KeyFormat::Large),
            Err(ParseError::InvalidField { field: "key_type", .. })
        ));
    }

    #[test]
    fn truncated_key_reports_insufficient_data() {
        let bytes = sample().encode(KeyFormat::Large);
        let err = Key::decode(&bytes[..20], KeyFormat::Large).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
        let r4: R4Error = err.into();
        assert!(r4.to_string().starts_with("parse error:"));
    }

    #[test]
    fn obj_key_id_and_de_id_sizes() {
        assert_eq!(ObjKeyId::size(KeyFormat::Large), 24);
        assert_eq!(ObjKeyId::size(KeyFormat::Small), 16);
        let id = ObjKeyId {
            locality: 3,
            ordering: 4,
            fulloid: 5,
        };
        assert_eq!(
            ObjKeyId::decode(&id.encode(KeyFormat::Large), KeyFormat::Large).unwrap(),
            id
        );
        let de = DeId {
            ordering: 0,
            fulloid: 8,
            offset: 9,
        };
        assert_eq!(de.encode(KeyFormat::Small).len(), DeId::size(KeyFormat::Small));
        assert_eq!(
            DeId::decode(&de.encode(KeyFormat::Small), KeyFormat::Small).unwrap(),
            de
        );
    }
}
