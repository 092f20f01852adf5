use std::cell::RefCell;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

use parking_lot::ReentrantMutex;
use tracing::{debug, trace, warn};

use crate::metrics::{self, REMOTE_FREES_DRAINED};
use crate::{
    DropPolicy, Page, PageAllocator, PageList, PageLookup, PageProvider, PageSource, PoolEngine,
    PoolSettings, Result, SystemPageAllocator, ThreadPoolData, ThreadPoolSchemaBuilder,
    bind_current, collect_free_pages, generate_pool_id, magic_for_pool, with_current,
};

/// A pool allocator that gives every thread its own size-class buckets.
///
/// Allocating never takes a lock on the common path: the calling thread allocates from pages
/// that only it manages. Deallocating on the thread that allocated is just as cheap. A slot
/// freed by any other thread is pushed onto a lock-free stack of the owning thread, which folds
/// it back into its pages on its next allocation.
///
/// The static block and the cache of unused pages are shared by all threads and protected by a
/// coarse lock, which is only taken when a thread needs a page, gives one back, registers itself
/// or collects garbage. In a dynamic pool, a thread keeps the last page of each size class it
/// uses even when that page becomes unused, so a steady allocate and free cycle never takes the
/// lock. A pool without dynamic pages returns every unused page to the shared cache right away,
/// because other threads may have no other way to obtain a page.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
/// use std::thread;
///
/// use page_pool::ThreadPoolSchema;
///
/// struct SendPtr(NonNull<u8>);
///
/// // SAFETY: The pool allows slots to be freed on any thread.
/// unsafe impl Send for SendPtr {}
///
/// let pool = ThreadPoolSchema::builder().static_pages(4).build().unwrap();
///
/// let ptr = SendPtr(pool.allocate(48, 16).unwrap());
///
/// // Free the slot on another thread. It goes back to the allocating thread's pages the next
/// // time that thread allocates.
/// thread::scope(|s| {
///     s.spawn(|| {
///         let ptr = ptr;
///
///         // SAFETY: The pointer was allocated from this pool and is not used afterwards.
///         unsafe { pool.deallocate(ptr.0) };
///     });
/// });
///
/// let ptr = pool.allocate(48, 16).unwrap();
///
/// // SAFETY: The pointer was allocated from this pool and is not used afterwards.
/// unsafe { pool.deallocate(ptr) };
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). Share it between threads by reference or
/// wrap it in an [`Arc`].
///
/// # Thread lifecycle
///
/// The per-thread state outlives the thread. When a thread exits, slots it allocated remain
/// valid and may be freed by any other thread. [`garbage_collect()`][Self::garbage_collect]
/// folds such frees back into the exited thread's pages so that its unused pages can be reused
/// or released.
#[derive(Debug)]
pub struct ThreadPoolSchema<A = SystemPageAllocator>
where
    A: PageAllocator,
{
    /// Distinguishes this pool's thread bindings from those of other pools.
    id: u64,

    source: PageSource<A>,
    shared: ReentrantMutex<RefCell<SharedState>>,

    spare_pages: usize,
    drop_policy: DropPolicy,
}

/// State shared by all threads of a pool, behind the coarse lock.
#[derive(Debug)]
struct SharedState {
    free_pages: PageList,

    /// Every thread that has ever allocated from the pool.
    threads: Vec<Arc<ThreadPoolData>>,
}

impl ThreadPoolSchema {
    /// Creates a builder for configuring and constructing a [`ThreadPoolSchema`].
    ///
    /// # Examples
    ///
    /// ```
    /// use page_pool::ThreadPoolSchema;
    ///
    /// let pool = ThreadPoolSchema::builder().build().unwrap();
    /// assert_eq!(pool.num_threads(), 0);
    /// ```
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> ThreadPoolSchemaBuilder {
        ThreadPoolSchemaBuilder::new()
    }
}

impl<A> ThreadPoolSchema<A>
where
    A: PageAllocator,
{
    pub(crate) fn new_inner(settings: PoolSettings<A>) -> Result<Self> {
        let layout = settings.layout();
        let id = generate_pool_id();

        let (source, free_pages) = PageSource::new(
            settings.page_allocator,
            layout,
            magic_for_pool(id),
            settings.static_pages,
            settings.is_dynamic,
        )?;

        debug!(
            id,
            page_size = layout.page_size(),
            min_allocation_size = layout.min_allocation_size(),
            max_allocation_size = layout.max_allocation_size(),
            static_pages = settings.static_pages,
            is_dynamic = settings.is_dynamic,
            "created thread pool schema"
        );

        Ok(Self {
            id,
            source,
            shared: ReentrantMutex::new(RefCell::new(SharedState {
                free_pages,
                threads: Vec::new(),
            })),
            spare_pages: settings.spare_pages,
            drop_policy: settings.drop_policy,
        })
    }

    fn provider(&self) -> SharedProvider<'_, A> {
        SharedProvider {
            source: &self.source,
            shared: &self.shared,
        }
    }

    /// Allocates a slot of at least `byte_size` bytes, aligned to `alignment`, from the calling
    /// thread's buckets.
    ///
    /// Slots freed by other threads since the calling thread last allocated are reconciled
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the size is outside the range served by the pool, if the alignment
    /// is not a power of two, if every static page is in use and the pool is not dynamic, or if
    /// the page allocator fails to provide a new page.
    pub fn allocate(&self, byte_size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if let Some(result) = with_current(self.id, |data| {
            // SAFETY: The data is bound to the current thread, which therefore owns it.
            unsafe { self.allocate_with(data, byte_size, alignment) }
        }) {
            return result;
        }

        self.allocate_unbound(byte_size, alignment)
    }

    /// Registers the calling thread, then allocates from its new thread data.
    #[cfg_attr(test, mutants::skip)] // Only the cold path, covered via allocate().
    fn allocate_unbound(&self, byte_size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let guard = self.shared.lock();

        let data = ThreadPoolData::new(self.id, *self.source.layout(), self.source.is_dynamic());
        guard.borrow_mut().threads.push(Arc::clone(&data));

        if bind_current(Arc::clone(&data)) {
            drop(guard);

            debug!(id = self.id, "registered thread with thread pool schema");

            // SAFETY: The data was just bound to the current thread, which therefore owns it.
            return unsafe { self.allocate_with(&data, byte_size, alignment) };
        }

        // The thread is tearing down its thread-local storage, so the data cannot be bound.
        // It is orphaned right away and we use it under the lock, which is the same way
        // garbage collection accesses orphaned data.
        data.mark_owner_exited();

        // SAFETY: We hold the lock and the data is orphaned.
        unsafe { self.allocate_with(&data, byte_size, alignment) }
    }

    /// # Safety
    ///
    /// The caller must have the right to access the engine of `data`.
    unsafe fn allocate_with(
        &self,
        data: &ThreadPoolData,
        byte_size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>> {
        let mut provider = self.provider();

        let allocate = |engine: &mut PoolEngine| {
            if data.has_remote_frees() {
                // SAFETY: Forwarding guarantees from the caller, `engine` belongs to `data`.
                unsafe {
                    reconcile_remote_frees(data, engine, &mut provider);
                }
            }

            engine.allocate(&mut provider, byte_size, alignment)
        };

        // SAFETY: Forwarding guarantees from the caller.
        unsafe { data.with_engine(allocate) }
    }

    /// Returns a slot to the pool.
    ///
    /// If the calling thread allocated the slot, it goes straight back to its page. Otherwise it
    /// is handed to the allocating thread without blocking.
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
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding guarantees from the caller.
        let page = unsafe { PoolEngine::locate_page(&self.source, self.source.layout(), ptr) };

        // SAFETY: The page was just located. The owner does not change while a slot of the page
        // is allocated, so reading it from any thread is fine.
        let owner = unsafe { Page::from_ptr(page) }
            .owner()
            .expect("pages assigned by a thread pool always have an owner");

        let freed_locally = with_current(self.id, |data| {
            if data.identity() != owner {
                return false;
            }

            let mut provider = self.provider();

            let deallocate = |engine: &mut PoolEngine| {
                // SAFETY: The page is owned by this engine and the slot is allocated, guaranteed
                // by the caller.
                unsafe {
                    engine.deallocate(&mut provider, ptr);
                }
            };

            // SAFETY: The data is bound to the current thread, which therefore owns it.
            unsafe {
                data.with_engine(deallocate);
            }

            true
        })
        .unwrap_or(false);

        if !freed_locally {
            // SAFETY: Page owners are thread data that the pool keeps alive until it is dropped,
            // and the caller guarantees the pool is still alive.
            let owner = unsafe { ThreadPoolData::from_identity(owner) };

            // SAFETY: Forwarding guarantees from the caller, the slot belongs to the owner.
            unsafe {
                owner.push_remote_free(ptr);
            }
        }
    }

    /// Returns the usable size of an allocated slot, which is the size of its bucket and may
    /// be larger than the size originally requested. May be called from any thread.
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
        let page = unsafe { PoolEngine::locate_page(&self.source, self.source.layout(), ptr) };

        // SAFETY: The page was just located. The element size does not change while a slot of
        // the page is allocated.
        unsafe { Page::from_ptr(page) }.element_size()
    }

    /// Folds slots freed by other threads back into the calling thread's pages.
    ///
    /// This happens automatically on every allocation. Calling it explicitly is useful for a
    /// thread that has stopped allocating but still owns pages, so those pages can become
    /// unused and be collected.
    pub fn reclaim(&self) {
        with_current(self.id, |data| {
            // SAFETY: The data is bound to the current thread, which therefore owns it.
            unsafe {
                self.reconcile(data);
            }
        });
    }

    /// Returns cached free pages to the page allocator.
    ///
    /// Before collecting, slots freed by other threads are reconciled for the calling thread and
    /// for every thread that has exited, and the unused pages these threads keep for their size
    /// classes are returned to the shared cache. Threads that are still running reconcile their
    /// own frees the next time they allocate or call [`reclaim()`][Self::reclaim].
    ///
    /// Static pages are always kept. Without `force`, up to the configured number of spare
    /// dynamic pages are kept as well. With `force`, every free dynamic page is released.
    ///
    /// Calling this frequently causes avoidable page allocator churn.
    pub fn garbage_collect(&self, force: bool) {
        with_current(self.id, |data| {
            // SAFETY: The data is bound to the current thread, which therefore owns it.
            unsafe {
                self.reconcile_and_release(data);
            }
        });

        let guard = self.shared.lock();

        // Snapshot, because reconciling returns pages to the shared state.
        let threads = guard.borrow().threads.clone();

        for data in threads.iter().filter(|data| data.owner_exited()) {
            // SAFETY: The owner has exited and we hold the lock.
            unsafe {
                self.reconcile_and_release(data);
            }
        }

        collect_free_pages(&mut self.provider(), force, self.spare_pages);
    }

    /// # Safety
    ///
    /// The caller must have the right to access the engine of `data`.
    unsafe fn reconcile(&self, data: &ThreadPoolData) {
        let mut provider = self.provider();

        let reconcile = |engine: &mut PoolEngine| {
            // SAFETY: Forwarding guarantees from the caller, `engine` belongs to `data`.
            unsafe {
                reconcile_remote_frees(data, engine, &mut provider);
            }
        };

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            data.with_engine(reconcile);
        }
    }

    /// Reconciles the remote frees of `data`, then hands the unused pages it keeps for its size
    /// classes to the shared cache.
    ///
    /// # Safety
    ///
    /// The caller must have the right to access the engine of `data`.
    unsafe fn reconcile_and_release(&self, data: &ThreadPoolData) {
        let mut provider = self.provider();

        let release = |engine: &mut PoolEngine| {
            // SAFETY: Forwarding guarantees from the caller, `engine` belongs to `data`.
            unsafe {
                reconcile_remote_frees(data, engine, &mut provider);
            }

            engine.release_spare_pages(&mut provider);
        };

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            data.with_engine(release);
        }
    }

    /// Number of bytes in slots currently handed out, counting the full bucket size of each.
    ///
    /// Slots freed by another thread than the one that allocated them are still counted until
    /// the allocating thread reconciles them.
    #[must_use]
    pub fn num_allocated_bytes(&self) -> usize {
        let guard = self.shared.lock();
        let state = guard.borrow();

        state
            .threads
            .iter()
            .map(|data| data.allocated_bytes())
            .fold(0, usize::saturating_add)
    }

    /// Number of threads that have allocated from the pool, including exited ones.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.shared.lock().borrow().threads.len()
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

/// Folds the slots freed by other threads back into the pages of `data`.
///
/// # Safety
///
/// The caller must have the right to access the engine of `data` and `engine` must be it.
unsafe fn reconcile_remote_frees<P>(
    data: &ThreadPoolData,
    engine: &mut PoolEngine,
    provider: &mut P,
) where
    P: PageProvider,
{
    let mut count = 0_usize;

    // SAFETY: Forwarding guarantees from the caller.
    for slot in unsafe { data.take_remote_frees() } {
        // SAFETY: Slots on the stack were allocated by this engine and are no longer used by
        // whoever freed them.
        unsafe {
            engine.deallocate(provider, slot);
        }

        count = count.wrapping_add(1);
    }

    if count > 0 {
        metrics::observe(&REMOTE_FREES_DRAINED, count);
        trace!(count, "reconciled remotely freed elements");
    }
}

impl<A> Drop for ThreadPoolSchema<A>
where
    A: PageAllocator,
{
    fn drop(&mut self) {
        let threads = mem::take(&mut self.shared.get_mut().get_mut().threads);

        let mut provider = self.provider();
        let mut live_bytes = 0_usize;

        for data in &threads {
            data.detach();

            let release = |engine: &mut PoolEngine| {
                // SAFETY: `engine` belongs to `data` and we have the right to access it, see
                // below.
                unsafe {
                    reconcile_remote_frees(data, engine, &mut provider);
                }

                live_bytes = live_bytes.saturating_add(engine.num_allocated_bytes());

                // SAFETY: The pool is going away, so no slot may be used anymore.
                unsafe {
                    engine.release_all_pages(&mut provider);
                }
            };

            // SAFETY: We have exclusive access to the pool, so no thread can be using any of its
            // thread data.
            unsafe {
                data.with_engine(release);
            }
        }

        collect_free_pages(&mut provider, true, 0);

        if live_bytes > 0 {
            match self.drop_policy {
                DropPolicy::MayDropAllocations => {
                    debug!(
                        id = self.id,
                        live_bytes, "dropped thread pool schema with live allocations"
                    );
                }
                DropPolicy::MustNotDropAllocations => {
                    warn!(
                        id = self.id,
                        live_bytes, "dropped thread pool schema with live allocations"
                    );

                    // Only panic if we are not already unwinding.
                    if !thread::panicking() {
                        panic!(
                            "dropped a thread pool with {live_bytes} bytes still allocated, violating DropPolicy::MustNotDropAllocations"
                        );
                    }
                }
            }
        }
    }
}

/// Page provider of [`ThreadPoolSchema`]: the page source plus the free-page list shared by
/// all threads. Every structural operation takes the coarse lock.
#[derive(Debug)]
struct SharedProvider<'a, A>
where
    A: PageAllocator,
{
    source: &'a PageSource<A>,
    shared: &'a ReentrantMutex<RefCell<SharedState>>,
}

impl<A> PageProvider for SharedProvider<'_, A>
where
    A: PageAllocator,
{
    fn pop_free_page(&mut self) -> Option<NonNull<Page>> {
        self.shared.lock().borrow_mut().free_pages.pop_front()
    }

    unsafe fn push_free_page(&mut self, page: NonNull<Page>) {
        let guard = self.shared.lock();

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            guard.borrow_mut().free_pages.push_front(page);
        }
    }

    fn construct_page(&mut self) -> Result<NonNull<Page>> {
        let _guard = self.shared.lock();
        self.source.construct_page()
    }

    unsafe fn free_page(&mut self, page: NonNull<Page>) {
        let _guard = self.shared.lock();

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            self.source.free_page(page);
        }
    }
}

impl<A> PageLookup for SharedProvider<'_, A>
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
