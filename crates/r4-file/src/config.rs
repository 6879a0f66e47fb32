//! File-level configuration.

use r4_error::{R4Error, Result};
use serde::{Deserialize, Serialize};

/// Pages copied per tail-to-extent iteration.
pub const TAIL2EXTENT_PAGE_NUM: usize = 3;

/// Pages copied per extent-to-tail iteration.
pub const EXTENT2TAIL_PAGE_NUM: usize = 1;

/// Smallest page size accepted.
pub const MIN_PAGE_SIZE: usize = 16;

/// Decides whether a file of a given size keeps its body in tail items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormattingPolicy {
    NeverTails,
    AlwaysTails,
    /// Tails while the file fits in `small_file_blocks` pages.
    #[default]
    SmallFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Page and unformatted block size in bytes.
    pub page_size: usize,
    pub tail2extent_pages: usize,
    pub extent2tail_pages: usize,
    pub formatting: FormattingPolicy,
    pub small_file_blocks: u64,
    /// Largest tail item a flow write creates.
    pub max_tail_item: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            tail2extent_pages: TAIL2EXTENT_PAGE_NUM,
            extent2tail_pages: EXTENT2TAIL_PAGE_NUM,
            formatting: FormattingPolicy::SmallFile,
            small_file_blocks: 4,
            max_tail_item: 4096,
        }
    }
}

impl FileConfig {
    /// Config with the given page size and defaults elsewhere.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            max_tail_item: page_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(R4Error::Format(format!(
                "page size {} must be a power of two >= {MIN_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.tail2extent_pages == 0 || self.extent2tail_pages == 0 {
            return Err(R4Error::Format(
                "conversion batch sizes must be non-zero".to_owned(),
            ));
        }
        if self.max_tail_item == 0 {
            return Err(R4Error::Format("max_tail_item must be non-zero".to_owned()));
        }
        Ok(())
    }

    /// Whether a file of `size` bytes belongs in tail items.
    #[must_use]
    pub fn have_tail(&self, size: u64) -> bool {
        match self.formatting {
            FormattingPolicy::NeverTails => false,
            FormattingPolicy::AlwaysTails => true,
            FormattingPolicy::SmallFile => {
                size <= self.small_file_blocks.saturating_mul(self.page_size as u64)
            }
        }
    }
}
