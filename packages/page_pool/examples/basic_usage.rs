//! Example that demonstrates basic usage of both pool flavors.
//!
//! This shows how to serve small allocations from a single-threaded pool and from a pool that
//! is shared between threads.

use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use page_pool::{PoolSchema, ThreadPoolSchema};

/// Slot pointer that is handed to another thread to be freed there.
struct SendPtr(NonNull<u8>);

// SAFETY: The thread pool allows slots to be freed on any thread.
unsafe impl Send for SendPtr {}

fn main() {
    println!("=== Page Pool README Example ===");

    // A pool serving 16..=256 byte requests, with two pages reserved up front.
    let mut pool = PoolSchema::builder()
        .page_size(NonZero::new(4096).unwrap())
        .min_allocation_size(NonZero::new(16).unwrap())
        .max_allocation_size(NonZero::new(256).unwrap())
        .static_pages(2)
        .build()
        .unwrap();

    let ptrs: Vec<_> = (0..200).map(|_| pool.allocate(32, 8).unwrap()).collect();

    println!("Allocated {} bytes", pool.num_allocated_bytes());
    println!("Dynamic pages in use: {}", pool.num_dynamic_pages());

    // Requests are rounded up to the next bucket.
    let odd = pool.allocate(20, 4).unwrap();

    // SAFETY: The pointer was allocated from this pool and not yet freed.
    let odd_size = unsafe { pool.allocation_size(odd) };
    println!("A 20 byte request got a {odd_size} byte slot");
    assert_eq!(odd_size, 32);

    // SAFETY: The pointer was allocated from this pool and is freed exactly once.
    unsafe { pool.deallocate(odd) };

    for ptr in ptrs {
        // SAFETY: Every pointer was allocated from this pool and is freed exactly once.
        unsafe { pool.deallocate(ptr) };
    }

    pool.garbage_collect(true);
    println!("Capacity after collection: {} bytes", pool.capacity());

    // The thread pool lets every thread allocate without locking.
    let thread_pool = ThreadPoolSchema::builder().build().unwrap();

    let ptr = SendPtr(thread_pool.allocate(100, 16).unwrap());

    thread::scope(|s| {
        s.spawn(|| {
            let ptr = ptr;

            // SAFETY: The pointer was allocated from this pool and is freed exactly once.
            unsafe { thread_pool.deallocate(ptr.0) };
        });
    });

    // The remote free is folded back into this thread's pages.
    thread_pool.reclaim();
    println!(
        "Thread pool bytes in use after reclaim: {}",
        thread_pool.num_allocated_bytes()
    );
    assert_eq!(thread_pool.num_allocated_bytes(), 0);

    println!("README example completed successfully!");
}
