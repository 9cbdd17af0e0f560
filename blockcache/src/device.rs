//! The block device is an external collaborator, referenced only by
//! interface: the cache never opens, formats, or otherwise knows how blocks
//! are physically stored. It only ever calls the three synchronous
//! operations below, and always with no cache lock held.

use crate::block::BlockId;

#[cfg(test)]
use mockall::automock;

/// Synchronous block-level I/O. Implementations fill or write exactly
/// `block_size()` bytes per block; there is no partial-block contract.
#[cfg_attr(test, automock(type Error = std::io::Error;))]
pub trait BlockDevice: Send + Sync {
	type Error: std::error::Error + Send + Sync + 'static;

	fn block_size(&self) -> usize;

	/// Fills `buf` (exactly `block_size()` bytes) with the on-disk contents
	/// of `block`.
	fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<(), Self::Error>;

	/// Writes `buf` (exactly `block_size()` bytes) to `block`.
	fn write_block(&self, buf: &[u8], block: BlockId) -> Result<(), Self::Error>;

	/// Scatter/gather write of `iov.len()` contiguous blocks starting at
	/// `start_block`. Callers guarantee `iov` is already in ascending block
	/// order.
	fn write_blocks(&self, iov: &[&[u8]], start_block: BlockId) -> Result<(), Self::Error>;
}
