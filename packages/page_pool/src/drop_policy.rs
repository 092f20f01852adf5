/// Determines how a pool treats allocations that are still live when the pool is dropped.
///
/// By default, dropping a pool releases all of its pages, including pages that still contain
/// live allocations. Any pointers into those pages dangle afterwards.
///
/// # Examples
///
/// ```
/// use page_pool::{DropPolicy, PoolSchema};
///
/// // The drop policy is set at pool creation time.
/// let pool = PoolSchema::builder()
///     .drop_policy(DropPolicy::MustNotDropAllocations)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool releases its pages when dropped, even if some allocations are still live.
    /// This is the default.
    #[default]
    MayDropAllocations,

    /// The pool will panic if it still contains live allocations when it is dropped.
    ///
    /// This may be valuable to catch leaks in code that is expected to return every
    /// allocation before tearing the pool down.
    MustNotDropAllocations,
}
