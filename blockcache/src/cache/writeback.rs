//! Dirty-page accumulation and clustered writeback.
//!
//! A [`WritebackPipeline`] sits in front of a [`super::PageCache`]: callers
//! hand it freshly dirtied pages, and it batches them until a cluster-size
//! threshold is reached, at which point it reassembles the batch into
//! contiguous scatter/gather writes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::cache::{PageCache, PageHandle};
use crate::device::BlockDevice;
use crate::error::CacheError;
use crate::extent::ExtentManager;

#[derive(Default)]
struct DirtyList {
	/// Most-recently-queued page at the front, matching the source's
	/// intrusive `dnext` list built by prepending.
	pages: Vec<PageHandle>,
}

/// Per-filesystem dirty-page list and unmount-time flush/invalidate paths.
///
/// `D` is the block device the cluster flush writes through; `E` is the
/// extent manager consulted at unmount.
pub struct WritebackPipeline<D, E> {
	cache: Arc<PageCache<D>>,
	extents: E,
	cluster_size: usize,
	dirty: Mutex<DirtyList>,
}

impl<D: BlockDevice, E: ExtentManager> WritebackPipeline<D, E> {
	pub fn new(cache: Arc<PageCache<D>>, extents: E, cluster_size: usize) -> Self {
		Self { cache, extents, cluster_size, dirty: Mutex::new(DirtyList::default()) }
	}

	pub fn dirty_count(&self) -> usize {
		self.dirty.lock().pages.len()
	}

	/// `addPageForWriteBack`: splices `pages` (caller's batch, in the order
	/// produced — most-recent-first) onto the *head* of the dirty list,
	/// matching `tail->p_dnext = fs->fs_dpages; fs->fs_dpages = head;` —
	/// the existing list is older and thus lower-numbered, so it belongs
	/// after the new batch for the whole accumulated list to stay a single
	/// reverse-block-order run. If the threshold is reached, detaches the
	/// whole list and flushes it.
	pub fn add_pages_for_writeback(&self, pages: Vec<PageHandle>) -> Result<(), CacheError> {
		let detached = {
			let mut dirty = self.dirty.lock();
			let mut merged = pages;
			merged.extend(std::mem::take(&mut dirty.pages));
			dirty.pages = merged;
			if dirty.pages.len() >= self.cluster_size {
				Some(std::mem::take(&mut dirty.pages))
			} else {
				None
			}
		};

		if let Some(batch) = detached {
			self.flush_page_cluster(batch)?;
		}
		Ok(())
	}

	/// `flushPageCluster`: reassembles a batch (queued in reverse block
	/// order) into ascending order, groups it into maximal contiguous runs,
	/// and flushes each run with a single scatter/gather write (or a plain
	/// single-block write for a run of length one) as soon as the run is
	/// found — in ascending start-block order. After I/O, hands the whole
	/// batch to [`PageCache::release_pages`].
	fn flush_page_cluster(&self, batch: Vec<PageHandle>) -> Result<(), CacheError> {
		let count = batch.len();
		log::debug!("flushing dirty page cluster of {count} pages");

		// the incoming batch is in reverse block order (most recently
		// queued at the front); reverse once to get ascending order, then
		// scan left to right.
		let mut ascending = batch;
		ascending.reverse();

		let mut run_start_idx = 0;
		let mut idx = 1;
		while idx <= ascending.len() {
			let run_continues = idx < ascending.len() && ascending[idx].block() == ascending[idx - 1].block() + 1;
			if !run_continues {
				self.flush_run(&ascending[run_start_idx..idx])?;
				run_start_idx = idx;
			}
			idx += 1;
		}

		self.cache.release_pages(ascending);
		Ok(())
	}

	fn flush_run(&self, run: &[PageHandle]) -> Result<(), CacheError> {
		let start_block = run[0].block();
		if run.len() == 1 {
			let page = &run[0];
			page.with_data(|buf| self.cache_device().write_block(buf, start_block))
				.expect("dirty page missing data buffer at flush")
				.map_err(|e| CacheError::Write(start_block, Box::new(e)))?;
			return Ok(());
		}

		let buffers: Vec<_> = run.iter().map(|p| p.with_data(<[u8]>::to_vec).expect("dirty page missing data buffer at flush")).collect();
		let iov: Vec<&[u8]> = buffers.iter().map(|b| b.as_slice()).collect();
		self.cache_device()
			.write_blocks(&iov, start_block)
			.map_err(|e| CacheError::WriteCluster(start_block, Box::new(e)))?;
		Ok(())
	}

	fn cache_device(&self) -> &D {
		self.cache.device_ref()
	}

	/// `invalidateDirtyPages`: detaches the dirty list without writing and
	/// hands it to [`PageCache::release_pages`]. Used when the filesystem
	/// is torn down with no commit.
	pub fn invalidate_dirty_pages(&self) {
		let detached = std::mem::take(&mut self.dirty.lock().pages);
		log::debug!("invalidating {} dirty pages without flush", detached.len());
		self.cache.release_pages(detached);
	}

	/// `flushDirtyPages`: pre-unmount flush. Detaches and flushes the dirty
	/// list (if non-empty and the filesystem is not marked removed), then
	/// frees `extents` — returning them to the free pool unless the
	/// filesystem was removed.
	///
	/// Precondition: callers must quiesce producers (stop calling
	/// [`Self::add_pages_for_writeback`]) before invoking this; no attempt
	/// is made to enforce that here, matching the source's own contract.
	pub fn flush_dirty_pages(
		&self,
		removed: bool,
		extents: Vec<E::Extent>,
	) -> Result<(), CacheError> {
		let detached = std::mem::take(&mut self.dirty.lock().pages);
		if !detached.is_empty() {
			if !removed {
				self.flush_page_cluster(detached)?;
			} else {
				// the filesystem is being removed: its blocks are being
				// discarded, so there is nothing to write, but the dirty
				// reference still has to be given up.
				self.cache.release_pages(detached);
			}
		}

		self.extents
			.free_extents(extents, !removed)
			.map_err(|e| CacheError::ExtentFree(Box::new(e)))
	}
}
