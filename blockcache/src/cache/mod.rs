//! The sharded block page cache: `block → Page` lookup, reference counting,
//! and lowest-hit-count eviction bounded to a single bucket per access.
//!
//! See [`bucket`] for the per-shard chain and [`writeback`] for the
//! dirty-page clustering pipeline built on top of this cache.

mod bucket;
pub mod writeback;

use std::sync::Arc;

use crate::alloc::{AlignedBuffer, Allocator, MemoryClass};
use crate::block::{assert_valid_block, BlockId, INVALID_BLOCK};
use crate::consts::{
	BLOCK_SIZE_RANGE, DEFAULT_BLOCK_SIZE, DEFAULT_CLUSTER_SIZE, DEFAULT_PAGE_MAX, DEFAULT_SHARD_COUNT,
};
use crate::device::BlockDevice;
use crate::error::{CacheError, ConfigError};
use crate::page::Page;
use crate::stats::CacheStats;

use bucket::{Bucket, LookupOutcome};

pub use writeback::WritebackPipeline;

/// Tunables for a [`PageCache`], grouped the way subsystem configuration is
/// grouped elsewhere in this codebase: a plain value type with a sane
/// [`Default`], validated by a dedicated free function before use.
#[derive(Debug, Clone, Copy)]
pub struct PageCacheConfig {
	/// Bytes per block; must be a power of two within [`BLOCK_SIZE_RANGE`].
	pub block_size: usize,
	/// Soft cap on total resident pages across all shards.
	pub page_max: usize,
	/// Writeback cluster threshold, in pages.
	pub cluster_size: usize,
	/// Shard (bucket) count.
	pub shard_count: usize,
}

impl Default for PageCacheConfig {
	fn default() -> Self {
		Self {
			block_size: DEFAULT_BLOCK_SIZE,
			page_max: DEFAULT_PAGE_MAX,
			cluster_size: DEFAULT_CLUSTER_SIZE,
			shard_count: DEFAULT_SHARD_COUNT,
		}
	}
}

/// Validates a [`PageCacheConfig`], mirroring the bounds-checking helper
/// pattern already used for page size validation elsewhere in this crate.
pub fn validate_config(config: &PageCacheConfig) -> Result<(), ConfigError> {
	if !BLOCK_SIZE_RANGE.contains(&config.block_size) || !config.block_size.is_power_of_two() {
		return Err(ConfigError::BlockSize(config.block_size));
	}
	if config.shard_count == 0 {
		return Err(ConfigError::ZeroShards);
	}
	if config.cluster_size == 0 {
		return Err(ConfigError::ZeroClusterSize);
	}
	Ok(())
}

/// A handle returned by [`PageCache::get_page`] and friends. Dropping it
/// does *not* release the page — callers must explicitly pass it to
/// [`PageCache::release_page`] or a bulk release, matching the source's
/// explicit `releasePage` contract (there is no destructor-driven refcount
/// here, since the cache itself, not the caller's stack frame, owns the
/// canonical `Arc`).
pub type PageHandle = Arc<Page>;

/// The sharded `block → Page` cache for a single mounted filesystem.
///
/// `D` is the block device backing reads and writes; `N` buckets partition
/// the key space by `block % N`. Construct with [`PageCache::new`] after
/// validating a [`PageCacheConfig`].
pub struct PageCache<D> {
	device: D,
	allocator: Arc<dyn Allocator>,
	stats: Arc<CacheStats>,
	buckets: Vec<Bucket>,
	shard_count: usize,
	block_size: usize,
	cap_per_bucket: usize,
}

impl<D: BlockDevice> PageCache<D> {
	pub fn new(device: D, allocator: Arc<dyn Allocator>, stats: Arc<CacheStats>, config: &PageCacheConfig) -> Self {
		let mut buckets = Vec::with_capacity(config.shard_count);
		buckets.resize_with(config.shard_count, Bucket::default);
		let cap_per_bucket = (config.page_max / config.shard_count).max(1);
		Self {
			device,
			allocator,
			stats,
			buckets,
			shard_count: config.shard_count,
			block_size: config.block_size,
			cap_per_bucket,
		}
	}

	pub fn stats(&self) -> &Arc<CacheStats> {
		&self.stats
	}

	pub(crate) fn device_ref(&self) -> &D {
		&self.device
	}

	fn hash(&self, block: BlockId) -> usize {
		(block % self.shard_count as u64) as usize
	}

	fn alloc_page_data(&self) -> Result<AlignedBuffer, CacheError> {
		self.allocator
			.alloc(MemoryClass::PageData, self.block_size)
			.ok_or(CacheError::Alloc(MemoryClass::PageData))
	}

	/// `newPage`: allocates a detached page and bumps the global allocated
	/// count. Does not publish it into any bucket.
	fn new_page(&self) -> Page {
		self.stats.record_alloc();
		Page::new_detached()
	}

	/// `freePage`: asserts full detachment and releases the slot back to
	/// the allocated-count bookkeeping. The buffer itself is simply dropped
	/// by `Arc`'s own destructor once this is the last reference.
	fn free_page(&self, page: &Page) {
		debug_assert_eq!(page.ref_count(), 0, "freeing a page with live references");
		debug_assert_eq!(page.block(), INVALID_BLOCK, "freeing an attached page");
		self.stats.record_free();
	}

	/// `getPage(fs, block, read)`: lookup-or-insert with racy-allocation
	/// reconciliation (§4.3). Returns a page with `refcount` incremented by
	/// one; if `read` is true, the returned page's data buffer holds the
	/// on-disk contents of `block`.
	pub fn get_page(&self, block: BlockId, read: bool) -> Result<PageHandle, CacheError> {
		assert_valid_block(block);
		let shard = self.hash(block);

		let mut candidate: Option<Arc<Page>> = None;
		let page = loop {
			let attempt = self.buckets[shard].lookup_or_publish(block, candidate.take());
			match attempt {
				LookupOutcome::Hit(page, loser) => {
					log::trace!("page cache hit for block {block}");
					self.stats.record_hit();
					if let Some(loser) = loser {
						// the loser of a racy-insert never got published;
						// `lc_freePage` it now that it's still privately
						// held (refcount == 1) and fully detached.
						let remaining = loser.drop_ref();
						debug_assert_eq!(remaining, 0, "discarded candidate had outstanding references");
						self.free_page(&loser);
					}
					break page;
				}
				LookupOutcome::Published(page) => {
					log::trace!("page cache publish for block {block}");
					break page;
				}
				LookupOutcome::Miss => {
					let fresh = Arc::new(self.new_page());
					candidate = Some(fresh);
					continue;
				}
			}
		};

		if read && !page.is_valid() {
			self.load_page(&page, block)?;
		}

		Ok(page)
	}

	fn load_page(&self, page: &Page, block: BlockId) -> Result<(), CacheError> {
		let device = &self.device;
		let ran = page
			.ensure_loaded(
				|| self.alloc_page_data(),
				|buf| device.read_block(block, buf).map_err(|e| CacheError::Read(block, Box::new(e))),
			)
			.map_err(|err| match err {
				CacheError::Alloc(_) => err,
				other => {
					log::debug!("read failed for block {block}, page left invalid for retry");
					other
				}
			})?;
		if ran {
			self.stats.record_miss();
			log::debug!("page cache miss for block {block}, loaded from device");
		}
		Ok(())
	}

	/// `releasePage(page, read)`: decrements refcount, bumps hit count on a
	/// read release, and evicts under pressure. The caller gives up its
	/// handle by value, matching the source's ownership-transfer contract.
	pub fn release_page(&self, page: PageHandle, read: bool) {
		let shard = self.hash(page.block());
		let victim = self.buckets[shard].release(&page, read, self.cap_per_bucket);
		drop(page);
		if let Some(victim) = victim {
			debug_assert_eq!(victim.ref_count(), 0);
			log::debug!("evicting page under bucket pressure, hitcount {}", victim.hit_count());
			self.free_page(&victim);
			self.stats.record_recycle();
		}
	}

	/// `releasePages`: bulk release of a detached list of composed pages
	/// (e.g. from [`Self::get_page_no_block`]), or of already-attached
	/// pages, matching `releasePage(false)` semantics for each.
	pub fn release_pages(&self, pages: Vec<PageHandle>) {
		for page in pages {
			if page.block() == INVALID_BLOCK {
				debug_assert_eq!(page.ref_count(), 1, "detached page released with extra references");
				page.drop_ref();
				self.free_page(&page);
			} else {
				self.release_page(page, false);
			}
		}
	}

	/// `releaseReadPages`: bulk release after a batch of reads completes.
	pub fn release_read_pages(&self, pages: Vec<PageHandle>) {
		for page in pages {
			self.release_page(page, true);
		}
	}

	/// `addPageBlockHash`: explicitly attaches an already-owned detached
	/// page under `block`, invalidating (without unlinking) any existing
	/// zombie with the same block.
	pub fn add_page_block_hash(&self, page: PageHandle, block: BlockId) {
		assert_valid_block(block);
		let shard = self.hash(block);
		self.buckets[shard].attach(page, block);
	}

	/// `getPageNew(block, data)`: acquire-or-insert without reading, then
	/// overwrite the page's buffer with caller-supplied data in place.
	/// Asserts the page was exclusively held (`refcount == 1`) beforehand.
	pub fn get_page_new(&self, block: BlockId, data: AlignedBuffer) -> Result<PageHandle, CacheError> {
		let page = self.get_page(block, false)?;
		debug_assert_eq!(page.ref_count(), 1, "getPageNew on a page with outstanding references");
		page.reset_hit();
		page.install_data(data);
		Ok(page)
	}

	/// `getPageNewData(block)`: acquire-or-insert without reading, ensuring
	/// a data buffer exists for the caller to copy into. Resets hit count.
	pub fn get_page_new_data(&self, block: BlockId) -> Result<PageHandle, CacheError> {
		let page = self.get_page(block, false)?;
		page.ensure_data(|| self.alloc_page_data())?;
		page.reset_hit();
		Ok(page)
	}

	/// `getPageNoBlock(data)`: a fresh detached page holding caller-supplied
	/// data, not published into any bucket. Used to compose a contiguous
	/// write run before block numbers are chosen.
	pub fn get_page_no_block(&self, data: AlignedBuffer) -> PageHandle {
		let page = self.new_page();
		page.install_data(data);
		Arc::new(page)
	}

	/// `destroy(remove)`: drains every bucket, asserting full detachment of
	/// every page it finds (the caller guarantees quiescence — no
	/// concurrent lookups). If `remove` is true, the number of pages freed
	/// is folded into the "reused" counter.
	pub fn destroy(&self, remove: bool) {
		let mut freed = 0u64;
		for bucket in &self.buckets {
			for page in bucket.drain() {
				debug_assert_eq!(Arc::strong_count(&page), 1, "bucket teardown with outstanding page handles");
				self.free_page(&page);
				freed += 1;
			}
		}
		if remove {
			self.stats.record_reused(freed);
		}
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use std::collections::HashMap;
	use std::io;
	use std::sync::Mutex;

	use crate::block::BlockId;
	use crate::device::BlockDevice;

	/// A minimal in-memory block device for tests and doctests. Not meant
	/// for production use.
	pub struct InMemoryBlockDevice {
		block_size: usize,
		blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
	}

	impl InMemoryBlockDevice {
		pub fn new(block_size: usize) -> Self {
			Self { block_size, blocks: Mutex::new(HashMap::new()) }
		}

		pub fn seed(&self, block: BlockId, contents: Vec<u8>) {
			self.blocks.lock().unwrap().insert(block, contents);
		}

		pub fn contents(&self, block: BlockId) -> Option<Vec<u8>> {
			self.blocks.lock().unwrap().get(&block).cloned()
		}
	}

	impl BlockDevice for InMemoryBlockDevice {
		type Error = io::Error;

		fn block_size(&self) -> usize {
			self.block_size
		}

		fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<(), Self::Error> {
			let blocks = self.blocks.lock().unwrap();
			let contents = blocks
				.get(&block)
				.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("block {block} not seeded")))?;
			buf.copy_from_slice(contents);
			Ok(())
		}

		fn write_block(&self, buf: &[u8], block: BlockId) -> Result<(), Self::Error> {
			self.blocks.lock().unwrap().insert(block, buf.to_vec());
			Ok(())
		}

		fn write_blocks(&self, iov: &[&[u8]], start_block: BlockId) -> Result<(), Self::Error> {
			let mut blocks = self.blocks.lock().unwrap();
			for (i, buf) in iov.iter().enumerate() {
				blocks.insert(start_block + i as u64, buf.to_vec());
			}
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;

	use super::test_support::InMemoryBlockDevice;
	use super::*;
	use crate::alloc::SystemAllocator;

	fn cache_with(config: PageCacheConfig) -> (PageCache<InMemoryBlockDevice>, usize) {
		let block_size = config.block_size;
		let device = InMemoryBlockDevice::new(block_size);
		let cache = PageCache::new(device, Arc::new(SystemAllocator), Arc::new(CacheStats::new()), &config);
		(cache, block_size)
	}

	#[test]
	fn scenario_1_single_reader_miss_then_hit_counters() {
		let (cache, block_size) = cache_with(PageCacheConfig { shard_count: 4, ..Default::default() });
		cache.device.seed(5, vec![7u8; block_size]);

		let page = cache.get_page(5, true).expect("read should succeed");
		assert_eq!(page.ref_count(), 1);
		assert_eq!(cache.stats.misses(), 1);
		assert!(page.with_data(|b| b.iter().all(|x| *x == 7)).unwrap());

		cache.release_page(Arc::clone(&page), true);
		assert_eq!(page.hit_count(), 1);
		assert_eq!(page.ref_count(), 0);
		assert!(page.is_attached());
	}

	#[test]
	fn scenario_2_concurrent_miss_dedupes_to_one_read() {
		// this is the one test actually racy enough that its hit/miss trace
		// logging is worth seeing under `RUST_LOG=trace`.
		let _ = env_logger::try_init();

		let (cache, block_size) = cache_with(PageCacheConfig { shard_count: 4, ..Default::default() });
		let cache = Arc::new(cache);
		cache.device.seed(7, vec![1u8; block_size]);

		let barrier = Arc::new(std::sync::Barrier::new(2));
		let threads: Vec<_> = (0..2)
			.map(|_| {
				let cache = Arc::clone(&cache);
				let barrier = Arc::clone(&barrier);
				thread::spawn(move || {
					barrier.wait();
					cache.get_page(7, true).expect("read should succeed")
				})
			})
			.collect();
		let pages: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

		assert!(Arc::ptr_eq(&pages[0], &pages[1]));
		assert_eq!(pages[0].ref_count(), 2);
		assert_eq!(cache.stats.hits() + cache.stats.misses(), 2);
		assert_eq!(cache.stats.misses(), 1);
	}

	#[test]
	fn scenario_3_duplicate_attach_invalidates_older_without_unlinking() {
		let (cache, block_size) = cache_with(PageCacheConfig { shard_count: 4, ..Default::default() });
		let p1 = cache.get_page_no_block(AlignedBuffer::zeroed(block_size, block_size));
		cache.add_page_block_hash(Arc::clone(&p1), 9);
		p1.drop_ref();

		let p2 = cache.get_page_no_block(AlignedBuffer::zeroed(block_size, block_size));
		cache.add_page_block_hash(Arc::clone(&p2), 9);

		assert_eq!(p1.block(), INVALID_BLOCK);
		assert_eq!(p2.block(), 9);
		assert_eq!(cache.buckets[cache.hash(9)].page_count(), 2);
	}

	#[test]
	fn scenario_6_eviction_drains_lowest_hit_count_page() {
		let (cache, _block_size) =
			cache_with(PageCacheConfig { shard_count: 1, page_max: 2, ..Default::default() });

		// insert and release one at a time; only the third release finds
		// pcount (3) exceeding the per-bucket cap (2).
		for block in [1u64, 2, 3] {
			let page = cache.get_page_new_data(block).unwrap();
			page.with_data_mut(|b| b.fill(0)).unwrap();
			cache.release_page(page, false);
		}

		assert_eq!(cache.stats.recycled(), 1);
		assert_eq!(cache.buckets[0].page_count(), 2);
	}

	#[test]
	fn validate_config_rejects_bad_block_size() {
		let mut config = PageCacheConfig::default();
		config.block_size = 100;
		assert!(matches!(validate_config(&config), Err(ConfigError::BlockSize(100))));
	}

	#[test]
	fn validate_config_rejects_zero_shards() {
		let mut config = PageCacheConfig::default();
		config.shard_count = 0;
		assert!(matches!(validate_config(&config), Err(ConfigError::ZeroShards)));
	}

	#[test]
	fn destroy_frees_all_resident_pages() {
		let (cache, _block_size) = cache_with(PageCacheConfig { shard_count: 2, ..Default::default() });
		let page = cache.get_page_new_data(4).unwrap();
		page.with_data_mut(|b| b.fill(9)).unwrap();
		cache.release_page(page, false);

		cache.destroy(true);
		assert_eq!(cache.stats.reused(), 1);
	}
}
