use thiserror::Error;

use crate::{alloc::MemoryClass, block::BlockId};

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// The fallible edges of the cache's contract: allocation on the miss path,
/// and device I/O. Everything else the source treats as an aborting
/// assertion stays a `panic!`/`debug_assert!` in this port too — see
/// DESIGN.md for the line between the two.
#[derive(Debug, Error)]
pub enum CacheError {
	#[error("failed to allocate {0:?} for the page cache")]
	Alloc(MemoryClass),

	#[error("failed to read block {0}: {1}")]
	Read(BlockId, #[source] BoxedSource),

	#[error("failed to write block {0}: {1}")]
	Write(BlockId, #[source] BoxedSource),

	#[error("failed to write block cluster starting at {0}: {1}")]
	WriteCluster(BlockId, #[source] BoxedSource),

	#[error("failed to free extents during unmount flush: {0}")]
	ExtentFree(#[source] BoxedSource),
}

/// Tunable validation failures raised by [`crate::cache::PageCacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(
		"block size {0} is invalid; must be a power of two between {} and {}",
		crate::units::display_size(*crate::consts::BLOCK_SIZE_RANGE.start()),
		crate::units::display_size(*crate::consts::BLOCK_SIZE_RANGE.end())
	)]
	BlockSize(usize),

	#[error("shard count must be greater than zero")]
	ZeroShards,

	#[error("cluster size must be greater than zero")]
	ZeroClusterSize,
}
