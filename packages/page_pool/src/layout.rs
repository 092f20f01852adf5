use std::alloc::Layout;
use std::mem;
use std::num::NonZero;
use std::ptr::NonNull;

use crate::{Error, FreeSlot, Page, Result};

/// Size-class and page geometry of a pool, derived once from the pool configuration.
///
/// Buckets are quantized in steps of the minimum allocation size: bucket `i` serves slots of
/// `(i + 1) << min_allocation_shift` bytes, so a pool serving `8..=256` bytes has 32 buckets
/// of 8, 16, 24, ..., 256 bytes.
///
/// Every page is a block of `page_size` bytes aligned to `page_size`, with the [`Page`] footer
/// occupying the last bytes of the block. Slots are laid out from the start of the block up to
/// the footer. This is what allows the footer to be found from any slot address by aligning
/// the address down to the page size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PoolLayout {
    page_size: usize,
    min_allocation_size: usize,
    max_allocation_size: usize,
    min_allocation_shift: u32,
    num_buckets: usize,
}

impl PoolLayout {
    /// # Panics
    ///
    /// Panics if the page size or minimum allocation size is not a power of two, if the
    /// minimum allocation size cannot hold a free-list link, if the maximum allocation size
    /// is not a multiple of the minimum, or if a page cannot hold at least one slot of the
    /// maximum allocation size next to its footer.
    #[must_use]
    pub(crate) fn new(
        page_size: NonZero<usize>,
        min_allocation_size: NonZero<usize>,
        max_allocation_size: NonZero<usize>,
    ) -> Self {
        let page_size = page_size.get();
        let min_allocation_size = min_allocation_size.get();
        let max_allocation_size = max_allocation_size.get();

        assert!(
            page_size.is_power_of_two(),
            "page size {page_size} must be a power of two"
        );
        assert!(
            u32::try_from(page_size).is_ok(),
            "page size {page_size} does not fit the 32-bit page bookkeeping"
        );
        assert!(
            min_allocation_size.is_power_of_two(),
            "minimum allocation size {min_allocation_size} must be a power of two"
        );
        assert!(
            min_allocation_size >= mem::size_of::<FreeSlot>(),
            "minimum allocation size {min_allocation_size} cannot hold a free-list link of {} bytes",
            mem::size_of::<FreeSlot>()
        );
        assert!(
            max_allocation_size >= min_allocation_size,
            "maximum allocation size {max_allocation_size} is smaller than minimum allocation size {min_allocation_size}"
        );
        assert!(
            max_allocation_size & min_allocation_size.wrapping_sub(1) == 0,
            "maximum allocation size {max_allocation_size} must be a multiple of minimum allocation size {min_allocation_size}"
        );

        let data_size = page_size.checked_sub(mem::size_of::<Page>());
        assert!(
            data_size.is_some_and(|data_size| data_size >= max_allocation_size),
            "page size {page_size} cannot fit a {max_allocation_size} byte slot next to the {} byte page footer",
            mem::size_of::<Page>()
        );

        let min_allocation_shift = min_allocation_size.trailing_zeros();

        Self {
            page_size,
            min_allocation_size,
            max_allocation_size,
            min_allocation_shift,
            num_buckets: max_allocation_size >> min_allocation_shift,
        }
    }

    #[must_use]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub(crate) fn min_allocation_size(&self) -> usize {
        self.min_allocation_size
    }

    #[must_use]
    pub(crate) fn max_allocation_size(&self) -> usize {
        self.max_allocation_size
    }

    #[must_use]
    pub(crate) fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Memory layout of one page block, as requested from the page allocator.
    #[must_use]
    pub(crate) fn block_layout(&self) -> Layout {
        Layout::from_size_align(self.page_size, self.page_size)
            .expect("page size was validated to be a power of two that fits in the address space")
    }

    /// Number of bytes at the start of each page block that are available for slots.
    /// The page footer starts right after them.
    #[must_use]
    pub(crate) fn footer_offset(&self) -> usize {
        // Cannot underflow, validated in the constructor.
        self.page_size.wrapping_sub(mem::size_of::<Page>())
    }

    /// Slot size of the given bucket.
    #[must_use]
    pub(crate) fn element_size(&self, bucket_index: usize) -> usize {
        debug_assert!(bucket_index < self.num_buckets);

        // Cannot overflow, bounded by the maximum allocation size.
        bucket_index.wrapping_add(1) << self.min_allocation_shift
    }

    /// Number of slots of the given bucket that fit in one page.
    #[must_use]
    #[expect(
        clippy::integer_division,
        reason = "the remainder that cannot hold a whole slot is left unused"
    )]
    pub(crate) fn elements_per_page(&self, bucket_index: usize) -> usize {
        self.footer_offset() / self.element_size(bucket_index)
    }

    /// Maps a request to the bucket that serves it.
    ///
    /// The size is rounded up to the alignment first, so that every slot of the selected
    /// bucket is aligned at least as strictly as requested. Slot sizes are multiples of the
    /// minimum allocation size and slots start at the page-aligned block start, so rounding to
    /// the alignment and then to the bucket granularity keeps every slot address aligned.
    pub(crate) fn bucket_index(&self, byte_size: usize, alignment: usize) -> Result<usize> {
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment { alignment });
        }

        let out_of_range = |size: usize| Error::SizeOutOfRange {
            size,
            min_allocation_size: self.min_allocation_size,
            max_allocation_size: self.max_allocation_size,
        };

        if byte_size < self.min_allocation_size || byte_size > self.max_allocation_size {
            return Err(out_of_range(byte_size));
        }

        let aligned_size = byte_size
            .checked_next_multiple_of(alignment)
            .ok_or_else(|| out_of_range(usize::MAX))?;

        if aligned_size > self.max_allocation_size {
            return Err(out_of_range(aligned_size));
        }

        // Cannot overflow or underflow: the maximum is a multiple of the minimum, so rounding
        // stays within `min..=max`.
        let granular_size = aligned_size.next_multiple_of(self.min_allocation_size);
        Ok(granular_size.wrapping_sub(self.min_allocation_size) >> self.min_allocation_shift)
    }

    /// Calculates where the footer of the page containing `address` would be, if `address`
    /// is inside a page of this layout.
    ///
    /// This is pure address arithmetic, nothing is read from memory.
    #[must_use]
    pub(crate) fn footer_for_address(&self, address: NonNull<u8>) -> NonNull<Page> {
        let page_mask = !self.page_size.wrapping_sub(1);
        let footer_offset = self.footer_offset();

        address
            .map_addr(|addr| {
                let footer_addr = (addr.get() & page_mask).wrapping_add(footer_offset);

                // The footer offset is non-zero because pages are larger than their footer,
                // so this is only zero if the address space wrapped around.
                NonZero::new(footer_addr).unwrap_or(addr)
            })
            .cast::<Page>()
    }

    /// Returns the footer pointer of a page block.
    ///
    /// # Safety
    ///
    /// `block` must point to the start of a page block of this layout.
    #[must_use]
    pub(crate) unsafe fn footer_of_block(&self, block: NonNull<u8>) -> NonNull<Page> {
        // SAFETY: The footer is inside the block, guaranteed by the caller.
        unsafe { block.byte_add(self.footer_offset()).cast::<Page>() }
    }

    /// Returns the start of the page block that `page` is the footer of.
    ///
    /// # Safety
    ///
    /// `page` must point to a footer of a page block of this layout.
    #[must_use]
    pub(crate) unsafe fn block_of_footer(&self, page: NonNull<Page>) -> NonNull<u8> {
        // SAFETY: The block start is inside the same block, guaranteed by the caller.
        unsafe { page.cast::<u8>().byte_sub(self.footer_offset()) }
    }
}
