use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Source of the raw page blocks that pools carve into slots.
///
/// Pools request blocks whose size equals their alignment (the page size), which is what lets
/// them find the page metadata of any slot by aligning the slot address down.
///
/// Implementations must be thread-safe because the thread-local pool requests pages from
/// whichever thread happens to need one.
pub trait PageAllocator: Send + Sync {
    /// Allocates a block of memory with the given layout.
    ///
    /// Returns `None` if the memory cannot be provided. The pool reports this to its caller
    /// as [`Error::PageAllocationFailed`][crate::Error::PageAllocationFailed] and does not retry.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by [`allocate()`][Self::allocate].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate()` on this allocator with the same `layout`
    /// and must not have been released already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Page allocator that obtains blocks from the Rust global allocator.
///
/// This is the default page allocator of all pools.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPageAllocator;

impl PageAllocator for SystemPageAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }

        // SAFETY: The layout is not zero-sized.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

impl<T> PageAllocator for &T
where
    T: PageAllocator + ?Sized,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { (**self).deallocate(ptr, layout) };
    }
}

impl<T> PageAllocator for Arc<T>
where
    T: PageAllocator + ?Sized,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { (**self).deallocate(ptr, layout) };
    }
}
