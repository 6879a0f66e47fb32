#![forbid(unsafe_code)]
//! Error types for r4.
//!
//! # Error Taxonomy
//!
//! r4 uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `r4-types` | On-disk key/id byte layout violations |
//! | Runtime | `R4Error` | `r4-error` (this crate) | Errors surfaced by tree, item and file operations |
//!
//! `r4-error` does not depend on `r4-types`; `ParseError` converts into
//! `R4Error::Parse` at the `r4-types` boundary.
//!
//! ## Conversion failure classes
//!
//! | Class | Variant | Retry safe |
//! |-------|---------|------------|
//! | Resource exhaustion | `NoSpace` | yes, nothing was mutated in the failing iteration |
//! | I/O fault | `Io`, `Fault` | yes, the MIXED breadcrumb lets a later call resume |
//! | Structural inconsistency | `NeedsFsck` | no, on-disk state may need offline repair |
//! | Contract violation | `InvariantViolation` | no, caller bug |
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw os error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `NeedsFsck` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvariantViolation` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `Fault` | `EFAULT` |
//! | `NotFound` | `ENOENT` |
//! | `Busy` | `EBUSY` |
//! | `NameTooLong` | `ENAMETOOLONG` |

use thiserror::Error;

/// Unified error type for all r4 operations.
#[derive(Debug, Error)]
pub enum R4Error {
    /// Operating system I/O error, or a page that did not become up to date.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tree content does not match what the caller's state implies.
    ///
    /// `object` is the objectid of the file whose items were inspected.
    #[error("corrupt tree content for object {object}: {detail}")]
    Corruption { object: u64, detail: String },

    /// Invalid configuration or geometry.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// Space reservation failed.
    #[error("no space left on device")]
    NoSpace,

    /// Copy to or from a user buffer faulted.
    #[error("bad address: {0}")]
    Fault(String),

    /// Item or object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object is in a state that does not allow the operation right now.
    #[error("resource busy: {0}")]
    Busy(String),

    /// A caller broke an operation precondition (interior tail cut,
    /// mid-item paste, overwrite past item end).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A conversion step left tree content half-converted. Offline repair
    /// may be required.
    #[error("inconsistent file body, run fsck: {0}")]
    NeedsFsck(String),

    /// Name exceeds the directory's limit.
    #[error("name too long")]
    NameTooLong,
}

impl R4Error {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::NeedsFsck(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvariantViolation(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::Fault(_) => libc::EFAULT,
            Self::NotFound(_) => libc::ENOENT,
            Self::Busy(_) => libc::EBUSY,
            Self::NameTooLong => libc::ENAMETOOLONG,
        }
    }

    /// Whether retrying the same call later can succeed without repair.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoSpace | Self::Io(_) | Self::Fault(_) | Self::Busy(_))
    }

    /// Shorthand for an `Io` error built from a message.
    #[must_use]
    pub fn io(detail: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(detail.into()))
    }
}

/// Result alias using `R4Error`.
pub type Result<T> = std::result::Result<T, R4Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(R4Error, libc::c_int)> = vec![
            (R4Error::Io(std::io::Error::other("test")), libc::EIO),
            (
                R4Error::Corruption {
                    object: 7,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (R4Error::Format("test".into()), libc::EINVAL),
            (R4Error::Parse("test".into()), libc::EINVAL),
            (R4Error::NoSpace, libc::ENOSPC),
            (R4Error::Fault("test".into()), libc::EFAULT),
            (R4Error::NotFound("test".into()), libc::ENOENT),
            (R4Error::Busy("test".into()), libc::EBUSY),
            (R4Error::InvariantViolation("test".into()), libc::EINVAL),
            (R4Error::NeedsFsck("test".into()), libc::EIO),
            (R4Error::NameTooLong, libc::ENAMETOOLONG),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(R4Error::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = R4Error::Corruption {
            object: 42,
            detail: "unexpected item kind".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt tree content for object 42: unexpected item kind"
        );
        assert_eq!(R4Error::NoSpace.to_string(), "no space left on device");
        assert!(
            R4Error::NeedsFsck("tail removed".into())
                .to_string()
                .contains("run fsck")
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(R4Error::NoSpace.is_retryable());
        assert!(R4Error::io("page not uptodate").is_retryable());
        assert!(!R4Error::NeedsFsck("x".into()).is_retryable());
        assert!(!R4Error::InvariantViolation("x".into()).is_retryable());
    }
}
