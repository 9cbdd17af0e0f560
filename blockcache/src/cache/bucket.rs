use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::page::Page;

/// One hash-chain shard of a [`crate::cache::PageCache`]. Chain order is
/// head-first (index 0 is the most recently published page), matching the
/// source's intrusive `cnext` chain with `bucket.head` at the front.
#[derive(Default)]
pub(crate) struct Bucket {
	inner: Mutex<BucketState>,
}

#[derive(Default)]
struct BucketState {
	chain: Vec<Arc<Page>>,
}

/// Outcome of a single scan-and-maybe-publish pass over a bucket, reported
/// back to [`super::PageCache::get_page`] so it can decide whether to retry
/// with a freshly allocated candidate.
pub(crate) enum LookupOutcome {
	/// An existing page matched. The second field is a candidate the caller
	/// had in hand but that lost the race — the caller must detach and free
	/// it (`lc_freePage`'s "loser" path), it is never published here.
	Hit(Arc<Page>, Option<Arc<Page>>),
	/// No match existed, but a candidate was supplied and is now published.
	Published(Arc<Page>),
	/// No match, and no candidate was available to publish.
	Miss,
}

impl Bucket {
	pub(crate) fn page_count(&self) -> usize {
		self.inner.lock().chain.len()
	}

	/// Scans the chain for `block`. If absent and `candidate` is `Some`,
	/// publishes it at the head. Mirrors `getPage`'s single-pass
	/// scan-or-publish step (§4.3 steps 2-3 of the page cache's lookup
	/// algorithm): the caller is expected to retry with a freshly allocated
	/// candidate on a plain `Miss`.
	pub(crate) fn lookup_or_publish(&self, block: BlockId, candidate: Option<Arc<Page>>) -> LookupOutcome {
		let mut state = self.inner.lock();
		if let Some(found) = state.chain.iter().find(|p| p.block() == block) {
			found.bump_ref();
			return LookupOutcome::Hit(Arc::clone(found), candidate);
		}
		match candidate {
			Some(page) => {
				page.set_block(block);
				state.chain.insert(0, Arc::clone(&page));
				LookupOutcome::Published(page)
			}
			None => LookupOutcome::Miss,
		}
	}

	/// `addPageBlockHash`: publishes an already-owned detached page under
	/// `block`, invalidating (but not unlinking) any existing zombie with
	/// the same block — see the "zombie reclaim" decision in DESIGN.md.
	pub(crate) fn attach(&self, page: Arc<Page>, block: BlockId) {
		let mut state = self.inner.lock();
		page.set_block(block);
		if let Some(stale) = state.chain.iter().find(|p| p.block() == block && !Arc::ptr_eq(p, &page)) {
			debug_assert_eq!(stale.ref_count(), 0, "duplicate block attach with a live reference");
			stale.set_block(crate::block::INVALID_BLOCK);
			log::warn!("zombie page left in chain for block {block}, pending next eviction pass");
		}
		state.chain.insert(0, page);
	}

	/// `releasePage`: decrements refcount, bumps hit count on a read
	/// release, and — if the bucket is over `cap` — evicts the lowest hit
	/// count page among the refcount-0 candidates, biased by the tie-break
	/// in §4.4 (last such page seen wins, draining the tail).
	///
	/// Returns the evicted victim, if any, for the caller to free outside
	/// the bucket lock.
	pub(crate) fn release(&self, page: &Arc<Page>, read: bool, cap: usize) -> Option<Arc<Page>> {
		let mut state = self.inner.lock();
		let remaining = page.drop_ref();
		debug_assert!(remaining != u32::MAX, "page refcount underflow on release");
		if read {
			page.bump_hit();
		}

		if state.chain.len() <= cap {
			return None;
		}

		// §4.4: `H` starts at the just-released page's own hit count, biasing
		// eviction toward it; only colder-or-equal refcount-0 pages are ever
		// considered, so a bucket full of hotter pages evicts nothing this
		// round.
		let mut victim_idx: Option<usize> = None;
		let mut min_hits = page.hit_count();
		for (idx, candidate) in state.chain.iter().enumerate() {
			if candidate.ref_count() != 0 {
				continue;
			}
			let hits = candidate.hit_count();
			if hits <= min_hits {
				min_hits = hits;
				victim_idx = Some(idx);
			}
		}

		victim_idx.map(|idx| {
			let victim = state.chain.remove(idx);
			victim.set_block(crate::block::INVALID_BLOCK);
			victim
		})
	}

	/// `destroy(remove)`: drains every page in the bucket, asserting the
	/// full detachment invariant the source guarantees at teardown
	/// (refcount is already zero by the time destroy runs).
	pub(crate) fn drain(&self) -> Vec<Arc<Page>> {
		let mut state = self.inner.lock();
		for page in state.chain.iter() {
			debug_assert_eq!(page.ref_count(), 0, "page still referenced at bucket teardown");
			page.set_block(crate::block::INVALID_BLOCK);
		}
		std::mem::take(&mut state.chain)
	}
}
