//! Worst-case block counts reserved before tree modification.
//!
//! Every estimate is a function of the tree height: each modified level
//! may dirty one node.

use crate::config::FileConfig;

/// Inserting a new item may split every level and grow the root.
#[must_use]
pub fn insert_item(height: u32) -> u64 {
    u64::from(height) + 1
}

#[must_use]
pub fn insert_into_item(height: u32) -> u64 {
    u64::from(height)
}

#[must_use]
pub fn item_removal(height: u32) -> u64 {
    u64::from(height)
}

/// Locking down from the root to a leaf.
#[must_use]
pub fn drilling(height: u32) -> u64 {
    u64::from(height)
}

#[must_use]
pub fn sd_update(height: u32) -> u64 {
    insert_into_item(height)
}

/// Inserting `bytes` of tail flow split into items of `max_tail_item`.
#[must_use]
pub fn flow_insert(height: u32, bytes: u64, max_tail_item: usize) -> u64 {
    let items = bytes.div_ceil(max_tail_item.max(1) as u64).max(1);
    items * insert_item(height)
}

/// One tail-to-extent iteration over `pages` pages.
#[must_use]
pub fn tail2extent(height: u32, pages: usize) -> u64 {
    let pages = pages as u64;
    insert_item(height) + pages + pages * insert_into_item(height) + drilling(height) + sd_update(height)
}

/// One extent-to-tail page.
#[must_use]
pub fn extent2tail(height: u32, config: &FileConfig) -> u64 {
    item_removal(height)
        + flow_insert(height, config.page_size as u64, config.max_tail_item)
        + drilling(height)
        + sd_update(height)
}

/// Writing `pages` pages through extents.
#[must_use]
pub fn extent_write(height: u32, pages: u64) -> u64 {
    pages + pages * insert_into_item(height) + sd_update(height)
}

/// Cutting the body tail off during a shrinking truncate.
#[must_use]
pub fn truncate(height: u32) -> u64 {
    item_removal(height) + sd_update(height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail2extent_counts_every_part() {
        // (h + 1) + N + N * h + h + h with h = 4, N = 3.
        assert_eq!(tail2extent(4, 3), 5 + 3 + 12 + 4 + 4);
    }

    #[test]
    fn flow_insert_counts_items() {
        assert_eq!(flow_insert(2, 0, 16), 3);
        assert_eq!(flow_insert(2, 16, 16), 3);
        assert_eq!(flow_insert(2, 17, 16), 6);
    }
}
