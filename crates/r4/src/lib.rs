#![forbid(unsafe_code)]
//! r4 public API facade.
//!
//! Re-exports the member crates under one roof. Downstream users depend on
//! this crate rather than on the pieces.

pub use r4_access as access;
pub use r4_error::{R4Error, Result};
pub use r4_file::{Container, ConversionReport, FileConfig, FileEnv, FormattingPolicy, UnixFile};
pub use r4_item as item;
pub use r4_key as key;
pub use r4_page as page;
pub use r4_tree as tree;
pub use r4_types::{BlockNumber, Key, KeyFormat, KeyType, ObjectId};
