use std::ops::RangeInclusive;

use crate::units::*;

/// Default block size for [`crate::cache::PageCacheConfig`].
pub const DEFAULT_BLOCK_SIZE: usize = 4 * KiB;

/// Valid block sizes: a power of two in this range.
pub const BLOCK_SIZE_RANGE: RangeInclusive<usize> = (512 * B)..=(64 * KiB);

/// Default soft cap on total resident pages across all shards.
pub const DEFAULT_PAGE_MAX: usize = 16 * 1024;

/// Default writeback cluster threshold, in pages.
pub const DEFAULT_CLUSTER_SIZE: usize = 32;

/// Default shard count. Prime, per the data model's "power of two or prime"
/// guidance, to spread sequential block numbers across buckets.
pub const DEFAULT_SHARD_COUNT: usize = 61;
