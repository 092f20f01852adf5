//! Metrics for the page pools.
//!
//! Only structural operations (obtaining and releasing pages, reconciling remote frees) are
//! observed. The per-slot allocate and deallocate paths are not instrumented.

use std::thread::LocalKey;

use nm::{Event, Magnitude};

/// Histogram buckets for the number of remotely freed slots reconciled in one drain.
///
/// Most drains are expected to pick up a handful of slots. Large batches indicate that a thread
/// frees a lot of memory allocated by another thread that rarely allocates.
const DRAIN_BATCH_SIZE_BUCKETS: &[Magnitude] = &[1, 2, 4, 8, 16, 32, 64, 128, 256, 1024];

/// Histogram buckets for the number of pages returned to the page allocator by one garbage
/// collection pass.
const GC_PAGES_RELEASED_BUCKETS: &[Magnitude] = &[0, 1, 2, 4, 8, 16, 32, 64];

thread_local! {
    /// A page block was obtained from the page allocator.
    pub(crate) static PAGES_CONSTRUCTED: Event = Event::builder()
        .name("page_pool_pages_constructed")
        .build();

    /// A page block was returned to the page allocator.
    pub(crate) static PAGES_RELEASED: Event = Event::builder()
        .name("page_pool_pages_released")
        .build();

    /// Slots freed by other threads were folded back into the owning thread's pages.
    ///
    /// The magnitude is the number of slots reconciled in one drain.
    pub(crate) static REMOTE_FREES_DRAINED: Event = Event::builder()
        .name("page_pool_remote_frees_drained")
        .histogram(DRAIN_BATCH_SIZE_BUCKETS)
        .build();

    /// A garbage collection pass completed.
    ///
    /// The magnitude is the number of pages returned to the page allocator.
    pub(crate) static GC_PAGES_RELEASED: Event = Event::builder()
        .name("page_pool_gc_pages_released")
        .histogram(GC_PAGES_RELEASED_BUCKETS)
        .build();
}

/// Records an observation of `magnitude`, unless the calling thread is already tearing down its
/// thread-local storage (e.g. when a pool is dropped from a thread-local destructor).
pub(crate) fn observe(event: &'static LocalKey<Event>, magnitude: usize) {
    let magnitude = Magnitude::try_from(magnitude).unwrap_or(Magnitude::MAX);

    _ = event.try_with(|e| e.observe(magnitude));
}
