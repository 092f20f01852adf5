use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::FreeSlot;

/// Intrusive multi-producer single-consumer stack of slots freed by threads other than the
/// thread that owns their page.
///
/// The freed slot itself stores the link, so pushing never allocates. Any thread may push.
/// Only the owning thread takes the elements out again, always all of them at once, which is
/// what keeps the stack free of ABA hazards: no node is ever popped individually while another
/// thread may be looking at it.
#[derive(Debug)]
pub(crate) struct FreedElementsStack {
    head: AtomicPtr<FreeSlot>,
}

impl FreedElementsStack {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes a freed slot. Safe to call from any number of threads concurrently.
    ///
    /// # Safety
    ///
    /// `slot` must be an allocated slot that is no longer used by anyone. It must be at least
    /// large and aligned enough to hold a [`FreeSlot`], which every slot of a pool is.
    pub(crate) unsafe fn push(&self, slot: NonNull<u8>) {
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            // SAFETY: Forwarding guarantees from the caller. The slot is not visible to anyone
            // else until the exchange below publishes it.
            let node = unsafe { FreeSlot::write(slot, NonNull::new(head)) };

            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Whether anything has been pushed since the last [`take_all()`][Self::take_all].
    ///
    /// This is a snapshot, other threads may push right after it was taken.
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Detaches every slot pushed so far.
    ///
    /// # Safety
    ///
    /// Only one thread at a time may take elements from the stack. For a thread's pool data this
    /// is the owning thread, or a thread holding the pool lock after the owner has exited.
    pub(crate) unsafe fn take_all(&self) -> FreedElements {
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        FreedElements {
            next: NonNull::new(head),
        }
    }
}

impl Default for FreedElementsStack {
    fn default() -> Self {
        Self::new()
    }
}

/// The slots detached from a [`FreedElementsStack`] by one [`take_all()`] call.
///
/// [`take_all()`]: FreedElementsStack::take_all
#[derive(Debug)]
pub(crate) struct FreedElements {
    next: Option<NonNull<FreeSlot>>,
}

impl Iterator for FreedElements {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.next?;

        // SAFETY: Every node was written by push() and published with release ordering, which
        // take_all() acquired. The link must be read before the caller reuses the slot.
        self.next = unsafe { FreeSlot::next(slot) };

        Some(slot.cast::<u8>())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::{Layout, alloc, dealloc};
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FreedElementsStack: Send, Sync);

    /// Memory for a bunch of 16 byte slots.
    struct Slots {
        memory: NonNull<u8>,
        layout: Layout,
        count: usize,
    }

    impl Slots {
        fn new(count: usize) -> Self {
            let layout = Layout::from_size_align(16 * count, 16).unwrap();

            // SAFETY: Non-zero sized layout.
            let memory = NonNull::new(unsafe { alloc(layout) }).unwrap();

            Self {
                memory,
                layout,
                count,
            }
        }

        fn slot(&self, index: usize) -> NonNull<u8> {
            assert!(index < self.count);

            // SAFETY: Within the allocation.
            unsafe { self.memory.byte_add(index * 16) }
        }
    }

    impl Drop for Slots {
        fn drop(&mut self) {
            // SAFETY: Allocated in new() with the same layout.
            unsafe { dealloc(self.memory.as_ptr(), self.layout) };
        }
    }

    // SAFETY: Test helper, the memory is plain bytes.
    unsafe impl Send for Slots {}
    // SAFETY: Test helper, threads only ever touch disjoint slots.
    unsafe impl Sync for Slots {}

    #[test]
    fn starts_empty() {
        let stack = FreedElementsStack::new();
        assert!(stack.is_empty());

        // SAFETY: Single-threaded test.
        assert_eq!(unsafe { stack.take_all() }.count(), 0);
    }

    #[test]
    fn take_all_returns_pushed_slots_in_lifo_order() {
        let slots = Slots::new(3);
        let stack = FreedElementsStack::new();

        for index in 0..3 {
            // SAFETY: Slots are unused and large enough.
            unsafe { stack.push(slots.slot(index)) };
        }

        assert!(!stack.is_empty());

        // SAFETY: Single-threaded test.
        let taken: Vec<_> = unsafe { stack.take_all() }.collect();
        assert_eq!(taken, vec![slots.slot(2), slots.slot(1), slots.slot(0)]);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_pushes_are_not_lost() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 500;

        let slots = Arc::new(Slots::new(THREADS * PER_THREAD));
        let stack = Arc::new(FreedElementsStack::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|thread_index| {
                let slots = Arc::clone(&slots);
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();

                    for index in 0..PER_THREAD {
                        let slot = slots.slot(thread_index * PER_THREAD + index);

                        // SAFETY: Every thread pushes its own disjoint slots.
                        unsafe { stack.push(slot) };
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // SAFETY: All producers have finished.
        let taken: HashSet<_> = unsafe { stack.take_all() }.collect();
        assert_eq!(taken.len(), THREADS * PER_THREAD);
    }
}
