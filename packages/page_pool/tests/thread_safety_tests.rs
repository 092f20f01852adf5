//! Multithreaded tests for `ThreadPoolSchema`.
//!
//! Slots are handed between threads as raw pointers, which is what the pool is designed for:
//! any thread may free a slot that any other thread allocated.

use std::mem;
use std::ptr::NonNull;
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;

use new_zealand::nz;
use page_pool::{DropPolicy, ThreadPoolSchema};

/// Raw slot pointer that may cross thread boundaries.
#[derive(Clone, Copy, Debug)]
struct SendPtr(NonNull<u8>);

impl SendPtr {
    fn get(self) -> NonNull<u8> {
        self.0
    }
}

// SAFETY: The pool allows slots to be freed on any thread.
unsafe impl Send for SendPtr {}
// SAFETY: See above, the pointer itself is never dereferenced concurrently.
unsafe impl Sync for SendPtr {}

fn allocate_many(pool: &ThreadPoolSchema, count: usize, size: usize) -> Vec<SendPtr> {
    (0..count)
        .map(|_| SendPtr(pool.allocate(size, 8).unwrap()))
        .collect()
}

#[test]
fn remote_frees_are_reused_by_the_allocating_thread() {
    let pool = ThreadPoolSchema::builder().build().unwrap();

    let ptrs = allocate_many(&pool, 200, 64);
    let pages_after_first_round = pool.num_dynamic_pages();

    thread::scope(|s| {
        s.spawn(|| {
            for ptr in ptrs {
                // SAFETY: Allocated above and freed exactly once.
                unsafe { pool.deallocate(ptr.get()) };
            }
        });
    });

    // The frees are pending until the allocating thread reconciles them.
    assert_eq!(pool.num_allocated_bytes(), 200 * 64);

    // Reconciled on the first allocation, so no new pages are needed for the second round.
    let ptrs = allocate_many(&pool, 200, 64);
    assert_eq!(pool.num_dynamic_pages(), pages_after_first_round);
    assert_eq!(pool.num_allocated_bytes(), 200 * 64);

    for ptr in ptrs {
        // SAFETY: Allocated above and freed exactly once.
        unsafe { pool.deallocate(ptr.get()) };
    }

    assert_eq!(pool.num_allocated_bytes(), 0);
}

#[test]
fn slots_of_exited_threads_are_collected() {
    let pool = Arc::new(ThreadPoolSchema::builder().build().unwrap());

    let ptrs = thread::spawn({
        let pool = Arc::clone(&pool);
        move || allocate_many(&pool, 100, 128)
    })
    .join()
    .unwrap();

    assert_eq!(pool.num_threads(), 1);
    assert_eq!(pool.num_allocated_bytes(), 100 * 128);

    for ptr in ptrs {
        // SAFETY: Allocated by the exited thread and freed exactly once.
        unsafe { pool.deallocate(ptr.get()) };
    }

    // Nobody has reconciled the exited thread's frees yet.
    assert_eq!(pool.num_allocated_bytes(), 100 * 128);
    assert!(pool.num_dynamic_pages() > 0);

    pool.garbage_collect(true);

    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.num_dynamic_pages(), 0);
}

#[test]
fn threads_free_each_others_slots_concurrently() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;
    const ROUNDS: usize = 3;

    let pool = ThreadPoolSchema::builder().static_pages(2).build().unwrap();
    let barrier = Barrier::new(THREADS);
    let mailboxes: Vec<Mutex<Vec<SendPtr>>> =
        (0..THREADS).map(|_| Mutex::new(Vec::new())).collect();

    thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread_index| {
                let pool = &pool;
                let barrier = &barrier;
                let mailboxes = &mailboxes;

                s.spawn(move || {
                    let neighbor = (thread_index + 1) % THREADS;

                    for round in 0..ROUNDS {
                        let size = 16 * (1 + (thread_index + round) % 8);

                        let ptrs = allocate_many(pool, PER_THREAD, size);

                        let fill = u8::try_from(thread_index).unwrap();

                        for ptr in &ptrs {
                            // SAFETY: The slot is ours and at least `size` bytes.
                            unsafe { ptr.get().write_bytes(fill, size) };
                        }

                        mailboxes[neighbor].lock().unwrap().extend(ptrs);

                        barrier.wait();

                        let received = mem::take(&mut *mailboxes[thread_index].lock().unwrap());
                        assert_eq!(received.len(), PER_THREAD);

                        for ptr in received {
                            // SAFETY: Allocated by the neighbor, handed to us and freed once.
                            unsafe { pool.deallocate(ptr.get()) };
                        }

                        barrier.wait();
                    }
                })
            })
            .collect();

        // Joining waits for thread-local storage to be torn down, which marks the threads
        // as exited.
        for handle in handles {
            handle.join().unwrap();
        }
    });

    assert_eq!(pool.num_threads(), THREADS);

    // Every thread has exited, so collection reconciles all remaining frees.
    pool.garbage_collect(true);

    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.num_dynamic_pages(), 0);
    assert_eq!(pool.capacity(), 2 * pool.page_size());
}

#[test]
fn slots_freed_remotely_while_owner_keeps_allocating() {
    const COUNT: usize = 2000;

    // Large pages, so the owner keeps handing out slots of the same page while they are freed.
    let pool = ThreadPoolSchema::builder()
        .page_size(nz!(65536))
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel::<SendPtr>();

    thread::scope(|s| {
        let pool = &pool;

        let freer = s.spawn(move || {
            for ptr in rx {
                // SAFETY: Allocated by the owner, handed to us and freed exactly once.
                unsafe { pool.deallocate(ptr.get()) };
            }
        });

        for index in 0..COUNT {
            let ptr = pool.allocate(16, 8).unwrap();

            let fill = u8::try_from(index % 251).unwrap();

            // SAFETY: The slot is at least 16 bytes and exclusively ours until sent.
            unsafe { ptr.write_bytes(fill, 16) };

            tx.send(SendPtr(ptr)).unwrap();
        }

        drop(tx);
        freer.join().unwrap();
    });

    pool.reclaim();

    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.num_threads(), 1);
}

#[test]
fn static_only_pool_is_shared_by_all_threads() {
    let pool = ThreadPoolSchema::builder()
        .static_pages(2)
        .dynamic(false)
        .build()
        .unwrap();

    // Every thread needs one page for its one allocation.
    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let ptr = pool.allocate(32, 8).unwrap();

                // SAFETY: Allocated above and freed exactly once.
                unsafe { pool.deallocate(ptr) };
            });
        }
    });

    // The exited threads returned their pages when they freed their only slots.
    let ptr = pool.allocate(32, 8).unwrap();
    let other = pool.allocate(256, 8).unwrap();

    // SAFETY: Allocated above and freed exactly once.
    unsafe { pool.deallocate(ptr) };
    // SAFETY: Allocated above and freed exactly once.
    unsafe { pool.deallocate(other) };
}

#[test]
fn pool_may_be_dropped_with_remote_frees_pending() {
    let pool = ThreadPoolSchema::builder()
        .drop_policy(DropPolicy::MustNotDropAllocations)
        .build()
        .unwrap();

    let ptrs = allocate_many(&pool, 50, 32);

    thread::scope(|s| {
        s.spawn(|| {
            for ptr in ptrs {
                // SAFETY: Allocated above and freed exactly once.
                unsafe { pool.deallocate(ptr.get()) };
            }
        });
    });

    // The pending frees are reconciled while dropping, so nothing counts as leaked.
    drop(pool);
}
