use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::metrics::{self, PAGES_CONSTRUCTED, PAGES_RELEASED};
use crate::{Error, Page, PageAllocator, PageList, PageLookup, PoolLayout, Result};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique pool ID.
pub(crate) fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Derives the page guard value of a pool from its ID.
///
/// Each pool gets its own guard so that a pointer returned to the wrong pool fails validation
/// just like a pointer that never came from a pool. Zero is reserved for released pages.
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    reason = "we only want the well-mixed high bits"
)]
pub(crate) fn magic_for_pool(pool_id: u64) -> u32 {
    const SEED: u32 = 0x5047_504C;

    let mixed = pool_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let magic = ((mixed >> 32) as u32) ^ SEED;

    if magic == 0 { SEED } else { magic }
}

/// The contiguous block of pages reserved when the pool is created.
#[derive(Debug)]
struct StaticBlock {
    start: NonNull<u8>,
    num_pages: usize,
    layout: Layout,
}

impl StaticBlock {
    fn contains(&self, address: NonNull<u8>) -> bool {
        let start = self.start.addr().get();

        address
            .addr()
            .get()
            .checked_sub(start)
            .is_some_and(|offset| offset < self.layout.size())
    }
}

/// Obtains, validates and releases page blocks on behalf of a pool.
///
/// This is the part of the page bookkeeping that does not depend on how a pool stores its
/// free-page cache: carving the static block into pages, growing beyond it with blocks from
/// the page allocator, releasing those blocks again and locating the page that an address
/// belongs to.
///
/// All methods take `&self`, the type is safe to share between threads as long as the page
/// allocator is. Pages themselves are not synchronized here; that is up to the pool.
#[derive(Debug)]
pub(crate) struct PageSource<A>
where
    A: PageAllocator,
{
    allocator: A,
    layout: PoolLayout,

    /// Guard value written into every page footer this source creates.
    magic: u32,

    static_block: Option<StaticBlock>,

    /// Whether pages may be obtained beyond the static block.
    is_dynamic: bool,

    /// Number of pages currently obtained beyond the static block.
    dynamic_pages: AtomicUsize,
}

// SAFETY: The static block is plain memory owned by the source, the pages in it are synchronized
// by the pools. The page allocator is required to be thread-safe.
unsafe impl<A> Send for PageSource<A> where A: PageAllocator {}

// SAFETY: See above. All mutation through `&self` is either atomic or goes to the thread-safe
// page allocator.
unsafe impl<A> Sync for PageSource<A> where A: PageAllocator {}

impl<A> PageSource<A>
where
    A: PageAllocator,
{
    /// Creates the page source, reserving the static block if one is configured.
    ///
    /// Returns the unassigned static pages alongside the source, ready to be placed in the
    /// pool's free-page cache.
    pub(crate) fn new(
        allocator: A,
        layout: PoolLayout,
        magic: u32,
        num_static_pages: usize,
        is_dynamic: bool,
    ) -> Result<(Self, PageList)> {
        let mut static_pages = PageList::new();

        let static_block = if num_static_pages == 0 {
            None
        } else {
            let size = layout
                .page_size()
                .checked_mul(num_static_pages)
                .expect("static block size cannot exceed the address space");

            let block_layout = Layout::from_size_align(size, layout.page_size())
                .expect("static block size cannot exceed the address space");

            let start = allocator
                .allocate(block_layout)
                .ok_or(Error::PageAllocationFailed {
                    size,
                    alignment: layout.page_size(),
                })?;

            assert_page_aligned(start, layout.page_size());

            for index in 0..num_static_pages {
                // Cannot overflow, the block size was checked above.
                let offset = index.wrapping_mul(layout.page_size());

                // SAFETY: The page lies within the static block we just allocated.
                let block = unsafe { start.byte_add(offset) };

                // SAFETY: `block` is the start of a page block of this layout.
                let footer = unsafe { layout.footer_of_block(block) };

                // SAFETY: The footer lies within fresh memory we own.
                unsafe {
                    Page::write_footer(footer, magic);
                }

                // SAFETY: The footer was just initialized and is not linked anywhere. It stays
                // valid until the source is dropped.
                unsafe {
                    static_pages.push_back(footer);
                }
            }

            debug!(
                num_static_pages,
                page_size = layout.page_size(),
                "reserved static page block"
            );

            Some(StaticBlock {
                start,
                num_pages: num_static_pages,
                layout: block_layout,
            })
        };

        Ok((
            Self {
                allocator,
                layout,
                magic,
                static_block,
                is_dynamic,
                dynamic_pages: AtomicUsize::new(0),
            },
            static_pages,
        ))
    }

    #[must_use]
    pub(crate) fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    #[must_use]
    pub(crate) fn num_static_pages(&self) -> usize {
        self.static_block.as_ref().map_or(0, |block| block.num_pages)
    }

    #[must_use]
    pub(crate) fn num_dynamic_pages(&self) -> usize {
        self.dynamic_pages.load(Ordering::Relaxed)
    }

    #[must_use]
    pub(crate) fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// Number of bytes of page memory currently held, static and dynamic.
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.num_static_pages()
            .saturating_add(self.num_dynamic_pages())
            .saturating_mul(self.layout.page_size())
    }

    /// Obtains a new page beyond the static block.
    ///
    /// Fails if the pool is not dynamic or if the page allocator cannot provide a block.
    pub(crate) fn construct_page(&self) -> Result<NonNull<Page>> {
        if !self.is_dynamic {
            return Err(Error::StaticPagesExhausted {
                static_pages: self.num_static_pages(),
            });
        }

        let block_layout = self.layout.block_layout();

        let block =
            self.allocator
                .allocate(block_layout)
                .ok_or(Error::PageAllocationFailed {
                    size: block_layout.size(),
                    alignment: block_layout.align(),
                })?;

        assert_page_aligned(block, self.layout.page_size());

        // SAFETY: `block` is a fresh page block of this layout.
        let footer = unsafe { self.layout.footer_of_block(block) };

        // SAFETY: The footer lies within fresh memory we own.
        unsafe {
            Page::write_footer(footer, self.magic);
        }

        let dynamic_pages = self
            .dynamic_pages
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        metrics::observe(&PAGES_CONSTRUCTED, 1);
        debug!(dynamic_pages, "constructed dynamic page");

        Ok(footer)
    }

    /// Returns a dynamic page to the page allocator.
    ///
    /// # Panics
    ///
    /// Panics if the page is part of the static block.
    ///
    /// # Safety
    ///
    /// `page` must be a page created by this source that is not linked into any list. Any slots
    /// still in use are lost. Nothing may reference the page afterwards.
    pub(crate) unsafe fn free_page(&self, page: NonNull<Page>) {
        assert!(
            !self.is_in_static_block(page),
            "static pages are never released to the page allocator"
        );

        // SAFETY: Guaranteed by the caller.
        unsafe { Page::from_ptr(page) }.invalidate();

        // SAFETY: The page was created by this source, so it is a footer of this layout.
        let block = unsafe { self.layout.block_of_footer(page) };

        // SAFETY: The block was obtained from the allocator in construct_page() with this layout.
        unsafe {
            self.allocator
                .deallocate(block, self.layout.block_layout());
        }

        let dynamic_pages = self
            .dynamic_pages
            .fetch_sub(1, Ordering::Relaxed)
            .wrapping_sub(1);

        metrics::observe(&PAGES_RELEASED, 1);
        debug!(dynamic_pages, "released dynamic page");
    }
}

impl<A> PageLookup for PageSource<A>
where
    A: PageAllocator,
{
    /// Locates the page that `address` belongs to, validating its guard value.
    ///
    /// The guard check catches addresses from other pools and pages that have already been
    /// released, but it is a diagnostic aid rather than a safety mechanism.
    ///
    /// The page footer location computed from `address` must be readable. This holds for any
    /// address handed out by a pool using this source whose page has not been released.
    unsafe fn page_from_address(&self, address: NonNull<u8>) -> Option<NonNull<Page>> {
        let footer = self.layout.footer_for_address(address);

        // SAFETY: Guaranteed by the caller. We only read the guard, which does not change while
        // the page is live.
        let magic = unsafe { Page::from_ptr(footer) }.magic();

        (magic == self.magic).then_some(footer)
    }

    fn is_in_static_block(&self, page: NonNull<Page>) -> bool {
        self.static_block
            .as_ref()
            .is_some_and(|block| block.contains(page.cast::<u8>()))
    }
}

impl<A> Drop for PageSource<A>
where
    A: PageAllocator,
{
    fn drop(&mut self) {
        debug_assert_eq!(
            self.num_dynamic_pages(),
            0,
            "pools release their dynamic pages before dropping the page source"
        );

        if let Some(block) = self.static_block.take() {
            // SAFETY: The static block was allocated in new() with this layout and the pool
            // that owned the source no longer references any of its pages.
            unsafe {
                self.allocator.deallocate(block.start, block.layout);
            }
        }
    }
}

fn assert_page_aligned(block: NonNull<u8>, page_size: usize) {
    assert!(
        block.addr().get() & page_size.wrapping_sub(1) == 0,
        "page allocator returned block {block:p} that is not aligned to the page size {page_size}"
    );
}
