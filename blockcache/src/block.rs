//! Block identifiers and the two reserved sentinel values.

/// A block number on the backing device.
pub type BlockId = u64;

/// The sentinel carried by pages that aren't attached to any block.
pub const INVALID_BLOCK: BlockId = u64::MAX;

/// Every public entry point that takes a caller-supplied block number relies
/// on this precondition; violating it is a programming error in the caller,
/// not a recoverable I/O condition, so it's asserted rather than returned as
/// an error.
#[inline]
pub(crate) fn assert_valid_block(block: BlockId) {
	debug_assert_ne!(block, 0, "block 0 is reserved");
	debug_assert_ne!(block, INVALID_BLOCK, "block INVALID is reserved");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	#[should_panic(expected = "reserved")]
	fn rejects_zero_block() {
		assert_valid_block(0);
	}

	#[test]
	#[should_panic(expected = "reserved")]
	fn rejects_invalid_block() {
		assert_valid_block(INVALID_BLOCK);
	}

	#[test]
	fn accepts_ordinary_block() {
		assert_valid_block(42);
	}
}
