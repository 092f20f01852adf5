use std::ptr::NonNull;

use tracing::debug;

use crate::metrics::{self, GC_PAGES_RELEASED};
use crate::{Bucket, Page, PageList, PoolLayout, Result};

/// Maps addresses to the pages of a pool.
pub(crate) trait PageLookup {
    /// Locates and validates the page that `address` belongs to.
    ///
    /// # Safety
    ///
    /// The page footer location computed from `address` must be readable.
    unsafe fn page_from_address(&self, address: NonNull<u8>) -> Option<NonNull<Page>>;

    fn is_in_static_block(&self, page: NonNull<Page>) -> bool;
}

/// Storage policy that a [`PoolEngine`] obtains pages from and returns pages to.
///
/// The engine does not care where unassigned pages are cached or how that cache is
/// synchronized. The single-threaded pool keeps a plain list, the thread-local pool keeps
/// one list shared by all threads behind a lock.
pub(crate) trait PageProvider: PageLookup {
    /// Takes an unassigned page from the free-page cache, if there is one.
    fn pop_free_page(&mut self) -> Option<NonNull<Page>>;

    /// Places an unassigned page in the free-page cache.
    ///
    /// # Safety
    ///
    /// `page` must be an unassigned page of this pool that is not linked into any list.
    unsafe fn push_free_page(&mut self, page: NonNull<Page>);

    /// Obtains a brand new unassigned page from the backing page allocator.
    fn construct_page(&mut self) -> Result<NonNull<Page>>;

    /// Returns a dynamic page to the backing page allocator.
    ///
    /// # Safety
    ///
    /// `page` must be a dynamic page of this pool that is not linked into any list. Nothing
    /// may reference the page afterwards.
    unsafe fn free_page(&mut self, page: NonNull<Page>);
}

/// The allocation algorithm shared by all pool flavors.
///
/// Owns one [`Bucket`] per size class and tracks how many slot bytes it has handed out.
/// Pages are obtained from and returned to a [`PageProvider`] passed into each operation.
///
/// Pages that become entirely unused are detached from their bucket and handed back to the
/// provider's free-page cache, except for the last page of a bucket, which the bucket keeps as
/// a spare if `keep_spare_pages` is set. A steady allocate/free cycle in one size class
/// therefore never goes back to the provider. Spares are handed to the provider by
/// [`release_spare_pages()`][Self::release_spare_pages]. Whether cached pages are eventually
/// returned to the page allocator is decided by [`collect_free_pages()`].
#[derive(Debug)]
pub(crate) struct PoolEngine {
    layout: PoolLayout,
    buckets: Box<[Bucket]>,

    keep_spare_pages: bool,

    /// Identity stamped into every page this engine assigns. Used by the thread-local pool to
    /// route frees to the owning thread.
    owner: Option<NonNull<()>>,

    allocated_bytes: usize,
}

impl PoolEngine {
    #[must_use]
    pub(crate) fn new(layout: PoolLayout, keep_spare_pages: bool) -> Self {
        let buckets = (0..layout.num_buckets()).map(|_| Bucket::new()).collect();

        Self {
            layout,
            buckets,
            keep_spare_pages,
            owner: None,
            allocated_bytes: 0,
        }
    }

    /// Sets the identity stamped into pages assigned from now on.
    pub(crate) fn set_owner(&mut self, owner: NonNull<()>) {
        debug_assert!(
            self.buckets.iter().all(|bucket| bucket.num_pages() == 0),
            "owner must be set before any page is assigned"
        );

        self.owner = Some(owner);
    }

    #[must_use]
    pub(crate) fn num_allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    fn bucket_mut(&mut self, bucket_index: usize) -> &mut Bucket {
        self.buckets
            .get_mut(bucket_index)
            .expect("bucket index was validated by the layout")
    }

    /// Takes a slot of at least `byte_size` bytes, aligned to `alignment`.
    pub(crate) fn allocate<P>(
        &mut self,
        provider: &mut P,
        byte_size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>>
    where
        P: PageProvider,
    {
        let bucket_index = self.layout.bucket_index(byte_size, alignment)?;
        let element_size = self.layout.element_size(bucket_index);

        let page = match self.bucket_mut(bucket_index).page_with_vacancy() {
            Some(page) => page,
            None => {
                let page = match provider.pop_free_page() {
                    Some(page) => page,
                    None => self.new_page(provider)?,
                };

                // SAFETY: Pages from the provider are live, unassigned and unlinked.
                unsafe { Page::from_ptr(page) }.assign(
                    bucket_index,
                    element_size,
                    self.layout.elements_per_page(bucket_index),
                    self.owner,
                );

                // SAFETY: The page was just assigned and is not linked anywhere.
                unsafe {
                    self.bucket_mut(bucket_index).add_page(page);
                }

                page
            }
        };

        // SAFETY: Pages linked into our buckets are live until we unlink them.
        let page_ref = unsafe { Page::from_ptr(page) };

        // SAFETY: The page is a footer of this layout.
        let block = unsafe { self.layout.block_of_footer(page) };

        // SAFETY: The block matches the footer and the page is assigned.
        let slot = unsafe { page_ref.pop_slot(block) }
            .expect("bucket front page was checked to have a vacant slot");

        if page_ref.is_full() {
            // SAFETY: The page is linked into this bucket.
            unsafe {
                self.bucket_mut(bucket_index).page_filled(page);
            }
        }

        // Cannot overflow, bounded by the memory held in pages.
        self.allocated_bytes = self.allocated_bytes.wrapping_add(element_size);

        Ok(slot)
    }

    /// Obtains a page from the page allocator. If that fails, spare pages parked in other
    /// buckets are handed to the provider and one of them is used instead.
    fn new_page<P>(&mut self, provider: &mut P) -> Result<NonNull<Page>>
    where
        P: PageProvider,
    {
        provider.construct_page().or_else(|error| {
            if self.release_spare_pages(provider) == 0 {
                return Err(error);
            }

            provider.pop_free_page().ok_or(error)
        })
    }

    /// Locates the page that an allocated slot belongs to.
    ///
    /// Only reads page state that does not change while a slot of the page is allocated, so
    /// this may be called from any thread.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is not at a slot boundary of a page of this pool. Foreign pointers
    /// are only detected on a best effort basis.
    ///
    /// # Safety
    ///
    /// The page footer location computed from `ptr` must be readable, which holds for any
    /// pointer returned by this pool that has not been freed.
    pub(crate) unsafe fn locate_page<L>(
        lookup: &L,
        layout: &PoolLayout,
        ptr: NonNull<u8>,
    ) -> NonNull<Page>
    where
        L: PageLookup + ?Sized,
    {
        // SAFETY: Forwarding guarantees from the caller.
        let page = unsafe { lookup.page_from_address(ptr) }
            .unwrap_or_else(|| panic!("pointer {ptr:p} was not allocated by this pool"));

        // SAFETY: The footer passed guard validation, so it is a live page of this pool.
        let page_ref = unsafe { Page::from_ptr(page) };

        // SAFETY: The page is a footer of this layout.
        let block = unsafe { layout.block_of_footer(page) };

        assert!(
            page_ref.is_assigned() && page_ref.slot_index(block, ptr).is_some(),
            "pointer {ptr:p} does not point to a slot of this pool"
        );

        page
    }

    /// Locates the page that an allocated slot of this engine belongs to, additionally
    /// checking that the slot has been handed out.
    ///
    /// # Panics
    ///
    /// Panics if the pointer does not point to the start of a slot handed out by this pool.
    ///
    /// # Safety
    ///
    /// Same as [`locate_page()`][Self::locate_page]. In addition, the page must not be
    /// concurrently used by another engine, which holds for slots this engine allocated.
    unsafe fn resolve_page<L>(&self, lookup: &L, ptr: NonNull<u8>) -> NonNull<Page>
    where
        L: PageLookup + ?Sized,
    {
        // SAFETY: Forwarding guarantees from the caller.
        let page = unsafe { Self::locate_page(lookup, &self.layout, ptr) };

        // SAFETY: The page was just located.
        let page_ref = unsafe { Page::from_ptr(page) };

        // SAFETY: The page is a footer of this layout.
        let block = unsafe { self.layout.block_of_footer(page) };

        assert!(
            page_ref.was_handed_out(block, ptr),
            "pointer {ptr:p} does not point to an allocated slot of this pool"
        );

        page
    }

    /// Returns a slot to the page it was allocated from.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] of this engine with the
    /// same provider and must not have been freed already. It must not be used afterwards.
    pub(crate) unsafe fn deallocate<P>(&mut self, provider: &mut P, ptr: NonNull<u8>)
    where
        P: PageProvider,
    {
        // SAFETY: Forwarding guarantees from the caller.
        let page = unsafe { self.resolve_page(provider, ptr) };

        // SAFETY: Forwarding guarantees from the caller, the page was just resolved.
        unsafe {
            self.deallocate_in_page(provider, page, ptr);
        }
    }

    /// Returns a slot to an already resolved page.
    ///
    /// If the page becomes entirely unused, it is detached from its bucket and handed to the
    /// provider's free-page cache, unless the bucket keeps it as its spare.
    ///
    /// # Safety
    ///
    /// `page` must be a page assigned by this engine and `ptr` must be an allocated slot of
    /// that page that is not used afterwards.
    unsafe fn deallocate_in_page<P>(
        &mut self,
        provider: &mut P,
        page: NonNull<Page>,
        ptr: NonNull<u8>,
    ) where
        P: PageProvider,
    {
        // SAFETY: Guaranteed by the caller.
        let page_ref = unsafe { Page::from_ptr(page) };

        debug_assert_eq!(page_ref.owner(), self.owner);

        let was_full = page_ref.is_full();
        let element_size = page_ref.element_size();
        let bucket_index = page_ref.bucket_index();

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            page_ref.push_slot(ptr);
        }

        self.allocated_bytes = self
            .allocated_bytes
            .checked_sub(element_size)
            .expect("freed more bytes than were allocated");

        if page_ref.is_unused() {
            let keep_spare_pages = self.keep_spare_pages;
            let bucket = self.bucket_mut(bucket_index);

            // The only page of a bucket stays assigned.
            if keep_spare_pages && bucket.num_pages() == 1 {
                return;
            }

            // SAFETY: Assigned pages are linked into the bucket of their index.
            unsafe {
                bucket.remove_page(page);
            }

            page_ref.retire();

            // SAFETY: The page was just unlinked and retired.
            unsafe {
                provider.push_free_page(page);
            }
        } else if was_full {
            // SAFETY: Assigned pages are linked into the bucket of their index.
            unsafe {
                self.bucket_mut(bucket_index).page_vacated(page);
            }
        }
    }

    /// Size of the slot that `ptr` points to, which may exceed the size originally requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be an allocated slot of this engine's pool.
    #[must_use]
    pub(crate) unsafe fn allocation_size<L>(&self, lookup: &L, ptr: NonNull<u8>) -> usize
    where
        L: PageLookup + ?Sized,
    {
        // SAFETY: Forwarding guarantees from the caller.
        let page = unsafe { self.resolve_page(lookup, ptr) };

        // SAFETY: The page was just resolved.
        unsafe { Page::from_ptr(page) }.element_size()
    }

    /// Hands the spare pages kept by the buckets to the provider's free-page cache.
    ///
    /// Returns the number of pages handed over.
    pub(crate) fn release_spare_pages<P>(&mut self, provider: &mut P) -> usize
    where
        P: PageProvider,
    {
        let mut released = 0_usize;

        for bucket in &mut self.buckets {
            if let Some(page) = bucket.take_unused_page() {
                // SAFETY: Pages taken from a bucket are live.
                unsafe { Page::from_ptr(page) }.retire();

                // SAFETY: The page was just unlinked and retired.
                unsafe {
                    provider.push_free_page(page);
                }

                released = released.wrapping_add(1);
            }
        }

        released
    }

    /// Tears down every page still assigned to a bucket, regardless of live slots.
    ///
    /// Dynamic pages go back to the page allocator. Static pages are simply forgotten, they are
    /// released together with the static block. Returns the number of pages torn down.
    ///
    /// # Safety
    ///
    /// No slot handed out by this engine may be used afterwards.
    pub(crate) unsafe fn release_all_pages<P>(&mut self, provider: &mut P) -> usize
    where
        P: PageProvider,
    {
        let mut released = 0_usize;

        for bucket in &mut self.buckets {
            while let Some(page) = bucket.pop_page() {
                if !provider.is_in_static_block(page) {
                    // SAFETY: The page was just unlinked and the caller guarantees that none of
                    // its slots are used anymore.
                    unsafe {
                        provider.free_page(page);
                    }
                }

                released = released.wrapping_add(1);
            }
        }

        self.allocated_bytes = 0;

        released
    }
}

/// Outcome of one [`collect_free_pages()`] pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Collected {
    /// Dynamic pages returned to the page allocator.
    pub(crate) released: usize,

    /// Pages left in the free-page cache, static and dynamic.
    pub(crate) retained: usize,
}

/// Returns cached free pages to the page allocator.
///
/// Static pages always stay in the cache. Up to `spare_pages` dynamic pages stay as well,
/// unless `force` is set, in which case every dynamic page is released.
pub(crate) fn collect_free_pages<P>(provider: &mut P, force: bool, spare_pages: usize) -> Collected
where
    P: PageProvider,
{
    let mut kept = PageList::new();
    let mut kept_dynamic = 0_usize;
    let mut released = 0_usize;

    while let Some(page) = provider.pop_free_page() {
        let is_static = provider.is_in_static_block(page);

        if is_static || (!force && kept_dynamic < spare_pages) {
            if !is_static {
                kept_dynamic = kept_dynamic.wrapping_add(1);
            }

            // SAFETY: The page was just taken from the cache, so it is unlinked.
            unsafe {
                kept.push_back(page);
            }
        } else {
            // SAFETY: The page was just taken from the cache, so it is unlinked and unused.
            unsafe {
                provider.free_page(page);
            }

            released = released.wrapping_add(1);
        }
    }

    let retained = kept.len();

    while let Some(page) = kept.pop_front() {
        // SAFETY: The page came from the cache and was just unlinked again.
        unsafe {
            provider.push_free_page(page);
        }
    }

    metrics::observe(&GC_PAGES_RELEASED, released);
    debug!(force, released, retained, "collected free pages");

    Collected { released, retained }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::{Error, PageSource, SystemPageAllocator};

    struct TestProvider {
        source: PageSource<SystemPageAllocator>,
        free_pages: PageList,
    }

    impl TestProvider {
        fn new(static_pages: usize, is_dynamic: bool) -> Self {
            let layout = PoolLayout::new(nz!(4096), nz!(16), nz!(256));
            let (source, free_pages) =
                PageSource::new(SystemPageAllocator, layout, 0x1234, static_pages, is_dynamic)
                    .unwrap();

            Self { source, free_pages }
        }

        fn layout(&self) -> PoolLayout {
            *self.source.layout()
        }
    }

    impl PageProvider for TestProvider {
        fn pop_free_page(&mut self) -> Option<NonNull<Page>> {
            self.free_pages.pop_front()
        }

        unsafe fn push_free_page(&mut self, page: NonNull<Page>) {
            // SAFETY: Forwarding guarantees from the caller.
            unsafe { self.free_pages.push_front(page) };
        }

        fn construct_page(&mut self) -> Result<NonNull<Page>> {
            self.source.construct_page()
        }

        unsafe fn free_page(&mut self, page: NonNull<Page>) {
            // SAFETY: Forwarding guarantees from the caller.
            unsafe { self.source.free_page(page) };
        }
    }

    impl PageLookup for TestProvider {
        unsafe fn page_from_address(&self, address: NonNull<u8>) -> Option<NonNull<Page>> {
            // SAFETY: Forwarding guarantees from the caller.
            unsafe { self.source.page_from_address(address) }
        }

        fn is_in_static_block(&self, page: NonNull<Page>) -> bool {
            self.source.is_in_static_block(page)
        }
    }

    impl Drop for TestProvider {
        fn drop(&mut self) {
            collect_free_pages(self, true, 0);
        }
    }

    /// An engine with its provider. Pages still assigned to the engine are torn down on drop.
    struct TestPool {
        engine: PoolEngine,
        provider: TestProvider,
    }

    impl TestPool {
        fn new(static_pages: usize, is_dynamic: bool) -> Self {
            Self::with_spare_pages(static_pages, is_dynamic, true)
        }

        fn with_spare_pages(static_pages: usize, is_dynamic: bool, keep_spare_pages: bool) -> Self {
            let provider = TestProvider::new(static_pages, is_dynamic);
            let engine = PoolEngine::new(provider.layout(), keep_spare_pages);

            Self { engine, provider }
        }

        fn layout(&self) -> PoolLayout {
            self.provider.layout()
        }

        fn allocate(&mut self, byte_size: usize, alignment: usize) -> Result<NonNull<u8>> {
            self.engine.allocate(&mut self.provider, byte_size, alignment)
        }

        /// # Safety
        ///
        /// Same as [`PoolEngine::deallocate()`].
        unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
            // SAFETY: Forwarding guarantees from the caller.
            unsafe { self.engine.deallocate(&mut self.provider, ptr) };
        }

        fn release_spare_pages(&mut self) -> usize {
            self.engine.release_spare_pages(&mut self.provider)
        }

        fn num_free_pages(&self) -> usize {
            self.provider.free_pages.len()
        }

        fn num_dynamic_pages(&self) -> usize {
            self.provider.source.num_dynamic_pages()
        }
    }

    impl Drop for TestPool {
        fn drop(&mut self) {
            // SAFETY: Tests do not touch their slots after dropping the pool.
            unsafe {
                self.engine.release_all_pages(&mut self.provider);
            }
        }
    }

    #[test]
    fn allocations_fill_pages_and_spill_to_next() {
        let mut pool = TestPool::new(2, false);

        let per_page = pool.layout().elements_per_page(1);

        let slots: Vec<_> = (0..200).map(|_| pool.allocate(32, 8).unwrap()).collect();

        assert!(per_page < 200);
        assert_eq!(pool.engine.num_allocated_bytes(), 200 * 32);
        assert_eq!(pool.num_free_pages(), 0);

        for slot in slots {
            // SAFETY: Allocated above and not yet freed.
            unsafe { pool.deallocate(slot) };
        }

        // The bucket keeps its last page.
        assert_eq!(pool.engine.num_allocated_bytes(), 0);
        assert_eq!(pool.num_free_pages(), 1);

        assert_eq!(pool.release_spare_pages(), 1);
        assert_eq!(pool.num_free_pages(), 2);
        assert_eq!(pool.release_spare_pages(), 0);
    }

    #[test]
    fn static_pages_exhausted_without_dynamic_growth() {
        let mut pool = TestPool::new(1, false);

        let per_page = pool.layout().elements_per_page(15);

        let slots: Vec<_> = (0..per_page)
            .map(|_| pool.allocate(256, 8).unwrap())
            .collect();

        assert!(matches!(
            pool.allocate(256, 8),
            Err(Error::StaticPagesExhausted { static_pages: 1 })
        ));

        // Other buckets need a page too and the only one is in use.
        assert!(matches!(
            pool.allocate(16, 8),
            Err(Error::StaticPagesExhausted { static_pages: 1 })
        ));

        for slot in slots {
            // SAFETY: Allocated above and not yet freed.
            unsafe { pool.deallocate(slot) };
        }
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut pool = TestPool::new(0, true);

        let keep = pool.allocate(64, 8).unwrap();
        let first = pool.allocate(64, 8).unwrap();

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(first) };

        let second = pool.allocate(64, 8).unwrap();
        assert_eq!(first, second);

        // SAFETY: Allocated above and not yet freed.
        unsafe {
            pool.deallocate(second);
        }
        // SAFETY: Allocated above and not yet freed.
        unsafe {
            pool.deallocate(keep);
        }
    }

    #[test]
    fn allocation_size_reports_slot_size() {
        let mut pool = TestPool::new(0, true);

        let slot = pool.allocate(20, 4).unwrap();

        // SAFETY: Allocated above and not yet freed.
        assert_eq!(unsafe { pool.engine.allocation_size(&pool.provider, slot) }, 32);

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(slot) };
    }

    #[test]
    fn full_page_moves_back_to_front_when_vacated() {
        let mut pool = TestPool::new(0, true);

        let per_page = pool.layout().elements_per_page(15);

        let mut slots: Vec<_> = (0..=per_page)
            .map(|_| pool.allocate(256, 8).unwrap())
            .collect();

        // The first page is full, the second one has a single slot in use.
        assert_eq!(pool.num_dynamic_pages(), 2);

        // Vacate one slot on the full page, the next allocation must land there rather than
        // requiring a third page.
        let from_full_page = slots.swap_remove(0);

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(from_full_page) };

        slots.push(pool.allocate(256, 8).unwrap());
        assert_eq!(pool.num_dynamic_pages(), 2);

        for slot in slots {
            // SAFETY: Allocated above and not yet freed.
            unsafe { pool.deallocate(slot) };
        }
    }

    #[test]
    fn emptied_last_page_stays_in_bucket() {
        let mut pool = TestPool::new(0, true);

        for _ in 0..100 {
            let slot = pool.allocate(64, 8).unwrap();

            // SAFETY: Allocated above and not yet freed.
            unsafe { pool.deallocate(slot) };
        }

        // The page never went back to the provider.
        assert_eq!(pool.num_dynamic_pages(), 1);
        assert_eq!(pool.num_free_pages(), 0);

        assert_eq!(pool.release_spare_pages(), 1);
        assert_eq!(pool.num_free_pages(), 1);
    }

    #[test]
    fn emptied_page_goes_to_cache_without_spares() {
        let mut pool = TestPool::with_spare_pages(0, true, false);

        let slot = pool.allocate(64, 8).unwrap();

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(slot) };

        assert_eq!(pool.num_free_pages(), 1);
        assert_eq!(pool.release_spare_pages(), 0);

        // The cached page is taken again instead of constructing a new one.
        let slot = pool.allocate(64, 8).unwrap();
        assert_eq!(pool.num_free_pages(), 0);
        assert_eq!(pool.num_dynamic_pages(), 1);

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(slot) };
    }

    #[test]
    fn collection_keeps_static_pages_and_spares() {
        let mut pool = TestPool::new(1, true);

        let per_page = pool.layout().elements_per_page(15);

        // Three pages worth of slots: one static and two dynamic pages.
        let slots: Vec<_> = (0..per_page * 3)
            .map(|_| pool.allocate(256, 8).unwrap())
            .collect();

        assert_eq!(pool.num_dynamic_pages(), 2);

        for slot in slots {
            // SAFETY: Allocated above and not yet freed.
            unsafe { pool.deallocate(slot) };
        }

        assert_eq!(pool.release_spare_pages(), 1);

        let collected = collect_free_pages(&mut pool.provider, false, 1);
        assert_eq!(
            collected,
            Collected {
                released: 1,
                retained: 2
            }
        );
        assert_eq!(pool.num_dynamic_pages(), 1);

        let collected = collect_free_pages(&mut pool.provider, true, 1);
        assert_eq!(
            collected,
            Collected {
                released: 1,
                retained: 1
            }
        );
        assert_eq!(pool.num_dynamic_pages(), 0);
        assert_eq!(pool.num_free_pages(), 1);
    }

    #[test]
    fn spare_page_is_reassigned_when_no_page_is_left() {
        let mut pool = TestPool::new(1, false);

        let small = pool.allocate(16, 8).unwrap();

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(small) };

        // The only page stays with the 16 byte bucket.
        assert_eq!(pool.num_free_pages(), 0);

        // Another size class takes it over rather than failing.
        let large = pool.allocate(128, 8).unwrap();

        // SAFETY: Allocated above and not yet freed.
        assert_eq!(
            unsafe { pool.engine.allocation_size(&pool.provider, large) },
            128
        );

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(large) };
    }

    #[test]
    fn release_all_pages_drops_live_allocations() {
        let mut pool = TestPool::new(1, true);

        for size in [16, 64, 256] {
            pool.allocate(size, 8).unwrap();
        }

        // SAFETY: We never touch the slots again.
        let released = unsafe { pool.engine.release_all_pages(&mut pool.provider) };

        assert_eq!(released, 3);
        assert_eq!(pool.engine.num_allocated_bytes(), 0);
        assert_eq!(pool.num_dynamic_pages(), 0);
    }

    #[test]
    fn located_page_accepts_any_slot_boundary() {
        let mut pool = TestPool::new(1, false);

        let slot = pool.allocate(64, 8).unwrap();

        // SAFETY: Still within the page.
        let next = unsafe { slot.byte_add(64) };

        let layout = pool.layout();

        // SAFETY: The footer is readable.
        let page = unsafe { PoolEngine::locate_page(&pool.provider, &layout, slot) };

        // The bump index is not consulted, so a slot that was never handed out is located too.
        // SAFETY: The footer is readable.
        let next_page = unsafe { PoolEngine::locate_page(&pool.provider, &layout, next) };
        assert_eq!(page, next_page);

        // SAFETY: Allocated above and not yet freed.
        unsafe { pool.deallocate(slot) };
    }

    #[test]
    #[should_panic]
    fn interior_pointer_is_rejected() {
        // Static pages only, so that unwinding does not leak dynamic pages.
        let mut pool = TestPool::new(1, false);

        let slot = pool.allocate(64, 8).unwrap();

        // SAFETY: Still within the slot.
        let interior = unsafe { slot.byte_add(8) };

        // SAFETY: The footer is readable. The call is expected to panic.
        unsafe { pool.deallocate(interior) };
    }

    #[test]
    #[should_panic]
    fn never_handed_out_slot_is_rejected() {
        let mut pool = TestPool::new(1, false);

        let slot = pool.allocate(64, 8).unwrap();

        // SAFETY: Still within the page, at the next slot boundary.
        let next = unsafe { slot.byte_add(64) };

        // SAFETY: The footer is readable. The call is expected to panic.
        unsafe { pool.deallocate(next) };
    }
}
