use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use new_zealand::nz;

use crate::{
    DropPolicy, PageAllocator, PoolLayout, PoolSchema, Result, SystemPageAllocator,
    ThreadPoolSchema,
};

const DEFAULT_PAGE_SIZE: NonZero<usize> = nz!(4096);
const DEFAULT_MIN_ALLOCATION_SIZE: NonZero<usize> = nz!(8);
const DEFAULT_MAX_ALLOCATION_SIZE: NonZero<usize> = nz!(256);
const DEFAULT_SPARE_PAGES: usize = 1;

/// Configuration shared by both pool builders.
#[derive(Debug)]
pub(crate) struct PoolSettings<A> {
    pub(crate) page_size: NonZero<usize>,
    pub(crate) min_allocation_size: NonZero<usize>,
    pub(crate) max_allocation_size: NonZero<usize>,
    pub(crate) static_pages: usize,
    pub(crate) is_dynamic: bool,
    pub(crate) spare_pages: usize,
    pub(crate) drop_policy: DropPolicy,
    pub(crate) page_allocator: A,
}

impl PoolSettings<SystemPageAllocator> {
    fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_allocation_size: DEFAULT_MIN_ALLOCATION_SIZE,
            max_allocation_size: DEFAULT_MAX_ALLOCATION_SIZE,
            static_pages: 0,
            is_dynamic: true,
            spare_pages: DEFAULT_SPARE_PAGES,
            drop_policy: DropPolicy::default(),
            page_allocator: SystemPageAllocator,
        }
    }
}

impl<A> PoolSettings<A> {
    fn with_page_allocator<B>(self, page_allocator: B) -> PoolSettings<B> {
        PoolSettings {
            page_size: self.page_size,
            min_allocation_size: self.min_allocation_size,
            max_allocation_size: self.max_allocation_size,
            static_pages: self.static_pages,
            is_dynamic: self.is_dynamic,
            spare_pages: self.spare_pages,
            drop_policy: self.drop_policy,
            page_allocator,
        }
    }

    /// Validates the configuration and derives the page geometry from it.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub(crate) fn layout(&self) -> PoolLayout {
        assert!(
            self.static_pages > 0 || self.is_dynamic,
            "a pool without static pages must be dynamic, otherwise it can never allocate"
        );

        PoolLayout::new(
            self.page_size,
            self.min_allocation_size,
            self.max_allocation_size,
        )
    }
}

/// Builder for creating an instance of [`PoolSchema`].
///
/// All settings are optional. By default, the pool serves requests of 8 to 256 bytes from
/// 4096 byte pages, has no static pages and obtains pages from the global allocator on demand.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use page_pool::PoolSchema;
///
/// let mut pool = PoolSchema::builder()
///     .min_allocation_size(NonZero::new(16).unwrap())
///     .max_allocation_size(NonZero::new(512).unwrap())
///     .static_pages(4)
///     .build()
///     .unwrap();
///
/// let ptr = pool.allocate(100, 8).unwrap();
///
/// // SAFETY: The pointer was just allocated from this pool and is not used afterwards.
/// unsafe { pool.deallocate(ptr) };
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct PoolSchemaBuilder<A = SystemPageAllocator> {
    settings: PoolSettings<A>,

    _not_sync: PhantomData<Cell<()>>,
}

impl PoolSchemaBuilder {
    pub(crate) fn new() -> Self {
        Self {
            settings: PoolSettings::new(),
            _not_sync: PhantomData,
        }
    }
}

impl<A> PoolSchemaBuilder<A>
where
    A: PageAllocator,
{
    /// Sets the size of each page. Must be a power of two and large enough to hold one slot of
    /// the maximum allocation size next to the page metadata.
    ///
    /// Pages are aligned to their size, which is how the pool finds the metadata of the page
    /// that a pointer belongs to.
    pub fn page_size(mut self, page_size: NonZero<usize>) -> Self {
        self.settings.page_size = page_size;
        self
    }

    /// Sets the smallest request size the pool serves. Must be a power of two of at least
    /// pointer size. Slot sizes are multiples of this value.
    pub fn min_allocation_size(mut self, size: NonZero<usize>) -> Self {
        self.settings.min_allocation_size = size;
        self
    }

    /// Sets the largest request size the pool serves. Must be a multiple of the minimum
    /// allocation size.
    pub fn max_allocation_size(mut self, size: NonZero<usize>) -> Self {
        self.settings.max_allocation_size = size;
        self
    }

    /// Sets the number of pages reserved as one contiguous block when the pool is built.
    ///
    /// Static pages are never returned to the page allocator before the pool is dropped.
    pub fn static_pages(mut self, count: usize) -> Self {
        self.settings.static_pages = count;
        self
    }

    /// Sets whether the pool may obtain pages beyond the static block. Defaults to `true`.
    ///
    /// A pool that is not dynamic fails allocations with
    /// [`Error::StaticPagesExhausted`][crate::Error::StaticPagesExhausted] once every static
    /// page is in use.
    pub fn dynamic(mut self, is_dynamic: bool) -> Self {
        self.settings.is_dynamic = is_dynamic;
        self
    }

    /// Sets how many free dynamic pages a non-forced garbage collection keeps cached.
    /// Defaults to 1.
    pub fn spare_pages(mut self, count: usize) -> Self {
        self.settings.spare_pages = count;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how
    /// to treat allocations that are still alive when the pool is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.settings.drop_policy = policy;
        self
    }

    /// Sets the allocator that page blocks are obtained from.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use page_pool::{PoolSchema, SystemPageAllocator};
    ///
    /// let page_allocator = Arc::new(SystemPageAllocator);
    ///
    /// let pool = PoolSchema::builder()
    ///     .page_allocator(Arc::clone(&page_allocator))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn page_allocator<B>(self, page_allocator: B) -> PoolSchemaBuilder<B>
    where
        B: PageAllocator,
    {
        PoolSchemaBuilder {
            settings: self.settings.with_page_allocator(page_allocator),
            _not_sync: PhantomData,
        }
    }

    /// Builds the pool with the specified configuration, reserving the static pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAllocationFailed`][crate::Error::PageAllocationFailed] if the page
    /// allocator cannot provide the static block.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid, for example if a size is not a power of two, if
    /// a page cannot hold a slot of the maximum allocation size or if the pool has neither
    /// static pages nor the ability to grow.
    pub fn build(self) -> Result<PoolSchema<A>> {
        PoolSchema::new_inner(self.settings)
    }
}

/// Builder for creating an instance of [`ThreadPoolSchema`].
///
/// Takes the same settings as [`PoolSchemaBuilder`]. The static pages are shared by all
/// threads that allocate from the pool.
///
/// # Examples
///
/// ```
/// use page_pool::ThreadPoolSchema;
///
/// let pool = ThreadPoolSchema::builder()
///     .static_pages(8)
///     .spare_pages(4)
///     .build()
///     .unwrap();
///
/// let ptr = pool.allocate(64, 8).unwrap();
///
/// // SAFETY: The pointer was just allocated from this pool and is not used afterwards.
/// unsafe { pool.deallocate(ptr) };
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct ThreadPoolSchemaBuilder<A = SystemPageAllocator> {
    settings: PoolSettings<A>,

    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadPoolSchemaBuilder {
    pub(crate) fn new() -> Self {
        Self {
            settings: PoolSettings::new(),
            _not_sync: PhantomData,
        }
    }
}

impl<A> ThreadPoolSchemaBuilder<A>
where
    A: PageAllocator,
{
    /// Sets the size of each page. Must be a power of two and large enough to hold one slot of
    /// the maximum allocation size next to the page metadata.
    pub fn page_size(mut self, page_size: NonZero<usize>) -> Self {
        self.settings.page_size = page_size;
        self
    }

    /// Sets the smallest request size the pool serves. Must be a power of two of at least
    /// pointer size.
    pub fn min_allocation_size(mut self, size: NonZero<usize>) -> Self {
        self.settings.min_allocation_size = size;
        self
    }

    /// Sets the largest request size the pool serves. Must be a multiple of the minimum
    /// allocation size.
    pub fn max_allocation_size(mut self, size: NonZero<usize>) -> Self {
        self.settings.max_allocation_size = size;
        self
    }

    /// Sets the number of pages reserved as one contiguous block when the pool is built.
    pub fn static_pages(mut self, count: usize) -> Self {
        self.settings.static_pages = count;
        self
    }

    /// Sets whether the pool may obtain pages beyond the static block. Defaults to `true`.
    pub fn dynamic(mut self, is_dynamic: bool) -> Self {
        self.settings.is_dynamic = is_dynamic;
        self
    }

    /// Sets how many free dynamic pages a non-forced garbage collection keeps cached.
    /// Defaults to 1.
    pub fn spare_pages(mut self, count: usize) -> Self {
        self.settings.spare_pages = count;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.settings.drop_policy = policy;
        self
    }

    /// Sets the allocator that page blocks are obtained from.
    pub fn page_allocator<B>(self, page_allocator: B) -> ThreadPoolSchemaBuilder<B>
    where
        B: PageAllocator,
    {
        ThreadPoolSchemaBuilder {
            settings: self.settings.with_page_allocator(page_allocator),
            _not_sync: PhantomData,
        }
    }

    /// Builds the pool with the specified configuration, reserving the static pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAllocationFailed`][crate::Error::PageAllocationFailed] if the page
    /// allocator cannot provide the static block.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn build(self) -> Result<ThreadPoolSchema<A>> {
        ThreadPoolSchema::new_inner(self.settings)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;
    use std::sync::Arc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PoolSchemaBuilder: Send, Debug);
    assert_not_impl_any!(PoolSchemaBuilder: Sync);
    assert_impl_all!(ThreadPoolSchemaBuilder: Send, Debug);
    assert_not_impl_any!(ThreadPoolSchemaBuilder: Sync);

    #[test]
    fn defaults() {
        let builder = PoolSchemaBuilder::new();

        assert_eq!(builder.settings.page_size.get(), 4096);
        assert_eq!(builder.settings.min_allocation_size.get(), 8);
        assert_eq!(builder.settings.max_allocation_size.get(), 256);
        assert_eq!(builder.settings.static_pages, 0);
        assert!(builder.settings.is_dynamic);
        assert_eq!(builder.settings.spare_pages, 1);
        assert_eq!(builder.settings.drop_policy, DropPolicy::MayDropAllocations);
    }

    #[test]
    fn settings_survive_page_allocator_swap() {
        let builder = ThreadPoolSchemaBuilder::new()
            .page_size(nz!(8192))
            .static_pages(3)
            .dynamic(false)
            .spare_pages(7)
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .page_allocator(Arc::new(SystemPageAllocator));

        assert_eq!(builder.settings.page_size.get(), 8192);
        assert_eq!(builder.settings.static_pages, 3);
        assert!(!builder.settings.is_dynamic);
        assert_eq!(builder.settings.spare_pages, 7);
        assert_eq!(
            builder.settings.drop_policy,
            DropPolicy::MustNotDropAllocations
        );
    }

    #[test]
    fn default_layout_has_32_buckets() {
        let layout = PoolSchemaBuilder::new().settings.layout();

        assert_eq!(layout.num_buckets(), 32);
    }

    #[test]
    #[should_panic]
    fn pool_that_can_never_allocate_panics() {
        let _pool = PoolSchemaBuilder::new().dynamic(false).build();
    }

    #[test]
    #[should_panic]
    fn thread_pool_that_can_never_allocate_panics() {
        let _pool = ThreadPoolSchemaBuilder::new().dynamic(false).build();
    }

    #[test]
    #[should_panic]
    fn page_too_small_for_max_allocation_panics() {
        let _pool = PoolSchemaBuilder::new()
            .page_size(nz!(256))
            .max_allocation_size(nz!(256))
            .build();
    }
}
