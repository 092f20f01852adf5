use thiserror::Error;

/// Errors that can occur when allocating memory from a pool.
///
/// Only conditions the caller can reasonably react to are reported as errors (e.g. by falling
/// back to a different allocation strategy). Misuse of the pool, such as returning a pointer
/// that the pool never handed out, is a programming defect and results in a panic instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested size (after rounding up to the requested alignment) is outside the
    /// inclusive range of sizes the pool was configured to serve.
    #[error(
        "cannot allocate {size} bytes from a pool that serves allocations of {min_allocation_size}..={max_allocation_size} bytes"
    )]
    SizeOutOfRange {
        /// The size that was rejected, after rounding up to the requested alignment.
        size: usize,

        /// The smallest allocation the pool serves.
        min_allocation_size: usize,

        /// The largest allocation the pool serves.
        max_allocation_size: usize,
    },

    /// The requested alignment is not a power of two.
    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment {
        /// The alignment that was rejected.
        alignment: usize,
    },

    /// Every statically reserved page is in use and the pool is not allowed to obtain
    /// additional pages from its page allocator.
    #[error("all {static_pages} static pages are in use and the pool is not dynamic")]
    StaticPagesExhausted {
        /// Number of static pages the pool was configured with.
        static_pages: usize,
    },

    /// The page allocator backing the pool failed to provide memory.
    #[error("page allocator failed to provide {size} bytes aligned to {alignment}")]
    PageAllocationFailed {
        /// Number of bytes requested from the page allocator.
        size: usize,

        /// Alignment requested from the page allocator.
        alignment: usize,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
