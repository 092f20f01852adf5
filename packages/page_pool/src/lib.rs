#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Size-class pool allocators that carve fixed-size slots out of page-aligned blocks.
//!
//! This crate provides two pool allocators for high-frequency small-object allocation:
//!
//! * [`PoolSchema`] is a single-threaded pool. Its mutating operations take `&mut self`.
//! * [`ThreadPoolSchema`] is shared between threads. Every thread allocates from its own pages
//!   without taking a lock, and slots freed by other threads are handed back to the allocating
//!   thread through a lock-free stack.
//!
//! Both pools serve requests between a configurable minimum and maximum size. Each request is
//! rounded up to a bucket whose slot size is a multiple of the minimum allocation size. Buckets
//! take pages from a static block reserved when the pool is built and, if the pool is dynamic,
//! from a [`PageAllocator`] on demand.
//!
//! # Page layout
//!
//! Every page is a block of `page_size` bytes aligned to `page_size`. The page metadata sits at
//! the end of the block, so the metadata of any slot is found by aligning the slot address down
//! to the page size. The metadata carries a guard value unique to the pool, which lets the pool
//! detect most pointers that it did not hand out.
//!
//! # Memory reuse
//!
//! A page that no longer has any slots in use is returned to a free-page cache and may be reused
//! by any bucket (and, for [`ThreadPoolSchema`], by any thread). The exception is the last page
//! of a bucket, which the bucket keeps so that allocating and freeing in a loop does not move
//! pages back and forth. Such a page is given up when another bucket cannot obtain a page
//! otherwise, and on `garbage_collect()`. A [`ThreadPoolSchema`] without dynamic pages never
//! keeps emptied pages, since other threads may depend on them.
//!
//! Calling `garbage_collect()` returns cached pages to the page allocator, except static pages,
//! which are kept until the pool is dropped, and a configurable number of spare pages.
//!
//! # Examples
//!
//! ```
//! use std::num::NonZero;
//!
//! use page_pool::{Error, PoolSchema};
//!
//! let mut pool = PoolSchema::builder()
//!     .page_size(NonZero::new(4096).unwrap())
//!     .min_allocation_size(NonZero::new(16).unwrap())
//!     .max_allocation_size(NonZero::new(256).unwrap())
//!     .static_pages(2)
//!     .build()
//!     .unwrap();
//!
//! let ptrs: Vec<_> = (0..200).map(|_| pool.allocate(32, 8).unwrap()).collect();
//! assert_eq!(pool.num_allocated_bytes(), 200 * 32);
//!
//! // Requests outside the configured range are rejected.
//! assert!(matches!(
//!     pool.allocate(512, 8),
//!     Err(Error::SizeOutOfRange { .. })
//! ));
//!
//! for ptr in ptrs {
//!     // SAFETY: Every pointer was allocated from this pool and is freed exactly once.
//!     unsafe { pool.deallocate(ptr) };
//! }
//!
//! // Static pages are never released, only returned to the free-page cache.
//! pool.garbage_collect(true);
//! assert_eq!(pool.capacity(), 2 * 4096);
//! ```
//!
//! # Logging and metrics
//!
//! Structural events (pages obtained and released, threads registered, garbage collection) are
//! logged via `tracing` at debug level and reported as `nm` events. Individual allocations are
//! neither logged nor measured.

mod bucket;
mod builder;
mod drop_policy;
mod engine;
mod error;
mod freed_elements;
mod layout;
mod metrics;
mod page;
mod page_allocator;
mod page_source;
mod pool_schema;
mod thread_data;
mod thread_pool_schema;

pub(crate) use bucket::*;
pub use builder::*;
pub use drop_policy::*;
pub(crate) use engine::*;
pub use error::*;
pub(crate) use freed_elements::*;
pub(crate) use layout::*;
pub(crate) use page::*;
pub use page_allocator::*;
pub(crate) use page_source::*;
pub use pool_schema::PoolSchema;
pub(crate) use thread_data::*;
pub use thread_pool_schema::ThreadPoolSchema;
