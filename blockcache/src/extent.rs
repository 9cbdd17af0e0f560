//! The extent manager is an external collaborator, referenced only by
//! interface: it owns the on-disk free space accounting this crate never
//! touches directly. The writeback pipeline calls into it exactly once, at
//! unmount, to free (or retain) the extents backing whatever dirty pages
//! were never flushed.

#[cfg(test)]
use mockall::automock;

/// Frees the extents backing a filesystem's unflushed dirty pages at
/// unmount.
#[cfg_attr(test, automock(type Extent = u64; type Error = std::io::Error;))]
pub trait ExtentManager: Send + Sync {
	type Extent: Send;
	type Error: std::error::Error + Send + Sync + 'static;

	/// `return_to_pool` is `false` exactly when the filesystem is being
	/// removed, in which case the extents are dropped rather than recycled.
	fn free_extents(
		&self,
		extents: Vec<Self::Extent>,
		return_to_pool: bool,
	) -> Result<(), Self::Error>;
}
