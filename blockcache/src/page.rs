use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::alloc::AlignedBuffer;
use crate::block::{BlockId, INVALID_BLOCK};

#[derive(Debug, Default)]
struct PageData {
	buf: Option<AlignedBuffer>,
	valid: bool,
}

/// The cached unit: a data buffer plus the bookkeeping the cache needs to
/// decide when it's safe to evict or free it.
///
/// `refcount` and `hitcount` are mutated only while the owning bucket's lock
/// is held (or, before publication, while the page is still privately owned
/// by whichever thread allocated it) — they're stored as atomics so `Page`
/// can be shared via `Arc` between the bucket chain, the dirty list, and a
/// caller's handle without a second layer of locking, not because any field
/// here is meant to be updated lock-free. `data` carries its own lock: it
/// doubles as the per-page data-load lock (`dlock`) guarding the
/// single-reader disk load, and continues to guard the buffer afterwards.
#[derive(Debug)]
pub struct Page {
	block: AtomicU64,
	refcount: AtomicU32,
	hitcount: AtomicU32,
	data: Mutex<PageData>,
}

assert_impl_all!(Page: Send, Sync);

impl Page {
	/// A freshly allocated page: `refcount = 1`, detached, no data buffer.
	pub(crate) fn new_detached() -> Self {
		Self {
			block: AtomicU64::new(INVALID_BLOCK),
			refcount: AtomicU32::new(1),
			hitcount: AtomicU32::new(0),
			data: Mutex::new(PageData::default()),
		}
	}

	pub fn block(&self) -> BlockId {
		self.block.load(Ordering::Acquire)
	}

	pub(crate) fn set_block(&self, block: BlockId) {
		self.block.store(block, Ordering::Release);
	}

	pub fn is_attached(&self) -> bool {
		self.block() != INVALID_BLOCK
	}

	pub fn ref_count(&self) -> u32 {
		self.refcount.load(Ordering::Acquire)
	}

	pub(crate) fn bump_ref(&self) {
		self.refcount.fetch_add(1, Ordering::AcqRel);
	}

	/// Decrements the refcount and returns the new value.
	pub(crate) fn drop_ref(&self) -> u32 {
		let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prev > 0, "page refcount underflow");
		prev - 1
	}

	pub fn hit_count(&self) -> u32 {
		self.hitcount.load(Ordering::Acquire)
	}

	pub(crate) fn bump_hit(&self) {
		self.hitcount.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn reset_hit(&self) {
		self.hitcount.store(0, Ordering::Release);
	}

	/// `dvalid`: true iff the data buffer reflects `block`'s current
	/// contents.
	pub fn is_valid(&self) -> bool {
		self.data.lock().valid
	}

	/// Runs `f` over the page's data buffer, if one is loaded.
	pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
		let guard = self.data.lock();
		guard.buf.as_deref().map(f)
	}

	/// Runs `f` over the page's data buffer mutably, if one is loaded. Used
	/// by callers composing a page via `getPageNewData` to copy their own
	/// contents in.
	pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
		let mut guard = self.data.lock();
		guard.buf.as_deref_mut().map(f)
	}

	/// Guards the single-reader disk load (`dlock`): if the buffer isn't
	/// valid yet, allocates it if necessary and runs `load` to populate it,
	/// marking it valid on success. Returns whether a load actually ran, so
	/// a racing thread that loses the race doesn't double-count a miss.
	///
	/// On a read failure the buffer is left in place but marked invalid, so
	/// a later retry can repopulate it without re-attaching the page.
	pub(crate) fn ensure_loaded<LoadErr>(
		&self,
		alloc_buf: impl FnOnce() -> Result<AlignedBuffer, LoadErr>,
		load: impl FnOnce(&mut [u8]) -> Result<(), LoadErr>,
	) -> Result<bool, LoadErr> {
		let mut guard = self.data.lock();
		if guard.valid {
			return Ok(false);
		}
		if guard.buf.is_none() {
			guard.buf = Some(alloc_buf()?);
		}
		let buf = guard.buf.as_deref_mut().expect("buffer was just allocated");
		match load(buf) {
			Ok(()) => {
				guard.valid = true;
				Ok(true)
			}
			Err(err) => {
				guard.valid = false;
				Err(err)
			}
		}
	}

	/// Takes ownership of the caller-supplied buffer, dropping whatever was
	/// there before. Used by `getPageNew` to overwrite a page in place.
	pub(crate) fn install_data(&self, data: AlignedBuffer) {
		let mut guard = self.data.lock();
		guard.buf = Some(data);
		guard.valid = true;
	}

	pub(crate) fn take_data(&self) -> Option<AlignedBuffer> {
		self.data.lock().buf.take()
	}

	/// Allocates a data buffer if the page doesn't already have one, without
	/// touching validity. Used by `getPageNewData`, whose caller is about to
	/// copy their own contents into the buffer.
	pub(crate) fn ensure_data<Err>(
		&self,
		alloc_buf: impl FnOnce() -> Result<AlignedBuffer, Err>,
	) -> Result<(), Err> {
		let mut guard = self.data.lock();
		if guard.buf.is_none() {
			guard.buf = Some(alloc_buf()?);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_page_is_detached_with_refcount_one() {
		let page = Page::new_detached();
		assert_eq!(page.block(), INVALID_BLOCK);
		assert!(!page.is_attached());
		assert_eq!(page.ref_count(), 1);
		assert_eq!(page.hit_count(), 0);
		assert!(!page.is_valid());
	}

	#[test]
	fn ensure_loaded_runs_once() {
		let page = Page::new_detached();
		let mut loads = 0;
		let first = page.ensure_loaded::<()>(
			|| Ok(AlignedBuffer::zeroed(4, 4)),
			|buf| {
				loads += 1;
				buf.copy_from_slice(b"moin");
				Ok(())
			},
		);
		assert_eq!(first, Ok(true));
		assert!(page.is_valid());

		let second = page.ensure_loaded::<()>(
			|| panic!("should not allocate again"),
			|_| panic!("should not load again"),
		);
		assert_eq!(second, Ok(false));
		assert_eq!(loads, 1);
		assert_eq!(page.with_data(|b| b.to_vec()), Some(b"moin".to_vec()));
	}

	#[test]
	fn failed_load_leaves_page_invalid_for_retry() {
		let page = Page::new_detached();
		let result = page.ensure_loaded(|| Ok(AlignedBuffer::zeroed(4, 4)), |_| Err("disk error"));
		assert_eq!(result, Err("disk error"));
		assert!(!page.is_valid());
		// the buffer itself is still there, ready for a retry to populate.
		assert!(page.with_data(|b| b.len()).is_some());
	}

	#[test]
	fn install_data_replaces_prior_buffer() {
		let page = Page::new_detached();
		page.install_data(buffer_with(&[1, 2, 3]));
		assert!(page.is_valid());
		page.reset_hit();
		page.install_data(buffer_with(&[4, 5]));
		assert_eq!(page.with_data(|b| b.to_vec()), Some(vec![4, 5]));
	}

	fn buffer_with(bytes: &[u8]) -> AlignedBuffer {
		let mut buf = AlignedBuffer::zeroed(1, bytes.len());
		buf.copy_from_slice(bytes);
		buf
	}
}
