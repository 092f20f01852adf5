use std::ptr::NonNull;
use std::thread;

use tracing::{debug, warn};

use crate::{
    DropPolicy, Page, PageAllocator, PageList, PageLookup, PageProvider, PageSource, PoolEngine,
    PoolSchemaBuilder, PoolSettings, Result, SystemPageAllocator, collect_free_pages,
    generate_pool_id, magic_for_pool,
};

/// A single-threaded pool allocator that serves small allocations from size-class buckets.
///
/// Requests between the minimum and maximum allocation size are rounded up to the nearest
/// bucket and served from pages dedicated to that bucket. Pages come from a static block that
/// is reserved when the pool is built and, if the pool is dynamic, from the page allocator on
/// demand.
///
/// Pages that become entirely unused go into a free-page cache and may be reused by any
/// bucket. [`garbage_collect()`][Self::garbage_collect] returns cached dynamic pages to the
/// page allocator. Static pages are only released when the pool is dropped.
///
/// # Examples
///
/// ```
/// use page_pool::PoolSchema;
///
/// let mut pool = PoolSchema::builder().static_pages(2).build().unwrap();
///
/// let ptr = pool.allocate(20, 8).unwrap();
///
/// // Requests are rounded up to the bucket size.
/// // SAFETY: The pointer was allocated from this pool and has not been freed.
/// assert_eq!(unsafe { pool.allocation_size(ptr) }, 24);
///
/// // SAFETY: The pointer was allocated from this pool and is not used afterwards.
/// unsafe { pool.deallocate(ptr) };
///
/// pool.garbage_collect(false);
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). Mutating operations
/// take `&mut self`, so the borrow checker serializes access. Use
/// [`ThreadPoolSchema`][crate::ThreadPoolSchema] to allocate from many threads at once.
#[derive(Debug)]
pub struct PoolSchema<A = SystemPageAllocator>
where
    A: PageAllocator,
{
    source: PageSource<A>,
    free_pages: PageList,
    engine: PoolEngine,

    spare_pages: usize,
    drop_policy: DropPolicy,
}

// SAFETY: The engine stores raw pointers to pages, all of which are owned by this pool and only
// touched through `&mut self` (or `&self` for reads). Moving the pool moves all of them at once.
unsafe impl<A> Send for PoolSchema<A> where A: PageAllocator {}

impl PoolSchema {
    /// Creates a builder for configuring and constructing a [`PoolSchema`].
    ///
    /// # Examples
    ///
    /// ```
    /// use page_pool::PoolSchema;
    ///
    /// let pool = PoolSchema::builder().build().unwrap();
    /// assert_eq!(pool.num_allocated_bytes(), 0);
    /// ```
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> PoolSchemaBuilder {
        PoolSchemaBuilder::new()
    }
}

impl<A> PoolSchema<A>
where
    A: PageAllocator,
{
    pub(crate) fn new_inner(settings: PoolSettings<A>) -> Result<Self> {
        let layout = settings.layout();
        let magic = magic_for_pool(generate_pool_id());

        let (source, free_pages) = PageSource::new(
            settings.page_allocator,
            layout,
            magic,
            settings.static_pages,
            settings.is_dynamic,
        )?;

        debug!(
            page_size = layout.page_size(),
            min_allocation_size = layout.min_allocation_size(),
            max_allocation_size = layout.max_allocation_size(),
            static_pages = settings.static_pages,
            is_dynamic = settings.is_dynamic,
            "created pool schema"
        );

        Ok(Self {
            source,
            free_pages,
            engine: PoolEngine::new(layout, true),
            spare_pages: settings.spare_pages,
            drop_policy: settings.drop_policy,
        })
    }

    fn parts(&mut self) -> (&mut PoolEngine, LocalProvider<'_, A>) {
        (
            &mut self.engine,
            LocalProvider {
                source: &self.source,
                free_pages: &mut self.free_pages,
            },
        )
    }

    /// Allocates a slot of at least `byte_size` bytes, aligned to `alignment`.
    ///
    /// The slot contents are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the size is outside the range served by the pool, if the alignment
    /// is not a power of two, if every static page is in use and the pool is not dynamic, or if
    /// the page allocator fails to provide a new page.
    pub fn allocate(&mut self, byte_size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let (engine, mut provider) = self.parts();
        engine.allocate(&mut provider, byte_size, alignment)
    }

    /// Returns a slot to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is detected to not point to an allocated slot of this pool. This
    /// detection is best effort and cannot catch every invalid pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] of this pool and must not
    /// have been deallocated already. The memory must not be accessed afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let (engine, mut provider) = self.parts();

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            engine.deallocate(&mut provider, ptr);
        }
    }

    /// Returns the usable size of an allocated slot, which is the size of its bucket and may
    /// be larger than the size originally requested.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is detected to not point to an allocated slot of this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] of this pool and must not
    /// have been deallocated yet.
    #[must_use]
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.engine.allocation_size(&self.source, ptr) }
    }

    /// Returns cached free pages to the page allocator.
    ///
    /// The unused page that each size class keeps for its next allocation is collected too.
    /// Static pages are always kept. Without `force`, up to the configured number of spare
    /// dynamic pages are kept as well, to avoid releasing and immediately re-obtaining pages
    /// under fluctuating load. With `force`, every free dynamic page is released.
    ///
    /// Calling this frequently causes avoidable page allocator churn.
    pub fn garbage_collect(&mut self, force: bool) {
        let spare_pages = self.spare_pages;
        let (engine, mut provider) = self.parts();

        engine.release_spare_pages(&mut provider);
        collect_free_pages(&mut provider, force, spare_pages);
    }

    /// Number of bytes in slots currently handed out, counting the full bucket size of each.
    #[must_use]
    pub fn num_allocated_bytes(&self) -> usize {
        self.engine.num_allocated_bytes()
    }

    /// Number of bytes held in pages, static and dynamic, whether in use or not.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.source.capacity()
    }

    /// Size of each page, including the page metadata.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.source.layout().page_size()
    }

    /// Smallest request size the pool serves.
    #[must_use]
    pub fn min_allocation_size(&self) -> usize {
        self.source.layout().min_allocation_size()
    }

    /// Largest request size the pool serves.
    #[must_use]
    pub fn max_allocation_size(&self) -> usize {
        self.source.layout().max_allocation_size()
    }

    /// Number of pages in the static block reserved when the pool was built.
    #[must_use]
    pub fn num_static_pages(&self) -> usize {
        self.source.num_static_pages()
    }

    /// Number of pages currently obtained from the page allocator beyond the static block.
    #[must_use]
    pub fn num_dynamic_pages(&self) -> usize {
        self.source.num_dynamic_pages()
    }

    /// Whether the pool may obtain pages beyond the static block.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.source.is_dynamic()
    }
}

impl<A> Drop for PoolSchema<A>
where
    A: PageAllocator,
{
    fn drop(&mut self) {
        let live_bytes = self.engine.num_allocated_bytes();

        let (engine, mut provider) = self.parts();

        // SAFETY: The pool is going away, so no slot may be used anymore. If the caller still
        // holds pointers, that is a violation of the deallocate contract they cannot act on.
        unsafe {
            engine.release_all_pages(&mut provider);
        }

        collect_free_pages(&mut provider, true, 0);

        if live_bytes > 0 {
            match self.drop_policy {
                DropPolicy::MayDropAllocations => {
                    debug!(live_bytes, "dropped pool schema with live allocations");
                }
                DropPolicy::MustNotDropAllocations => {
                    warn!(live_bytes, "dropped pool schema with live allocations");

                    // Only panic if we are not already unwinding.
                    if !thread::panicking() {
                        panic!(
                            "dropped a pool with {live_bytes} bytes still allocated, violating DropPolicy::MustNotDropAllocations"
                        );
                    }
                }
            }
        }
    }
}

/// Page provider of [`PoolSchema`]: the page source plus a plain free-page list.
#[derive(Debug)]
struct LocalProvider<'a, A>
where
    A: PageAllocator,
{
    source: &'a PageSource<A>,
    free_pages: &'a mut PageList,
}

impl<A> PageProvider for LocalProvider<'_, A>
where
    A: PageAllocator,
{
    fn pop_free_page(&mut self) -> Option<NonNull<Page>> {
        self.free_pages.pop_front()
    }

    unsafe fn push_free_page(&mut self, page: NonNull<Page>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            self.free_pages.push_front(page);
        }
    }

    fn construct_page(&mut self) -> Result<NonNull<Page>> {
        self.source.construct_page()
    }

    unsafe fn free_page(&mut self, page: NonNull<Page>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            self.source.free_page(page);
        }
    }
}

impl<A> PageLookup for LocalProvider<'_, A>
where
    A: PageAllocator,
{
    unsafe fn page_from_address(&self, address: NonNull<u8>) -> Option<NonNull<Page>> {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.source.page_from_address(address) }
    }

    fn is_in_static_block(&self, page: NonNull<Page>) -> bool {
        self.source.is_in_static_block(page)
    }
}
