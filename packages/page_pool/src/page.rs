use std::cell::Cell;
use std::ptr::NonNull;

/// Bucket index of a page that is not currently serving any size class, either because it has
/// just been carved out of a block or because it is parked in the free-page cache.
const UNASSIGNED_BUCKET: u32 = u32::MAX;

/// Link written into the first bytes of a slot while the slot is not allocated.
///
/// The same memory is payload while the slot is allocated and a free-list node while it is not,
/// which is why the minimum allocation size must be at least the size of this type.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

impl FreeSlot {
    /// Turns an unused slot into a free-list node pointing at `next`.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of a `FreeSlot` and suitably aligned. The memory must not
    /// be in use by anyone else.
    pub(crate) unsafe fn write(
        slot: NonNull<u8>,
        next: Option<NonNull<Self>>,
    ) -> NonNull<Self> {
        let slot = slot.cast::<Self>();

        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            slot.write(Self { next });
        }

        slot
    }

    /// Reads the link stored in a free slot.
    ///
    /// # Safety
    ///
    /// `slot` must have been initialized via [`write()`][Self::write] and not reused since.
    pub(crate) unsafe fn next(slot: NonNull<Self>) -> Option<NonNull<Self>> {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { slot.read().next }
    }
}

/// Metadata footer stored at the end of every page block.
///
/// A page serves equally sized slots for one bucket at a time. Slots are handed out from the
/// intrusive free list first and, once that is empty, from the never-used tail of the block
/// (tracked by `untouched_index`). This partitions the block into slots without having to
/// touch every slot when the page is assigned to a bucket.
///
/// # Concurrency
///
/// All mutable state is held in `Cell`s and the type is only ever accessed through shared
/// references. The thread that owns the page is the only one that mutates it. Other threads
/// may concurrently read fields that do not change while the page is assigned (the guard value,
/// the bucket, the owner, the element size and the slot count), which is why no code path ever
/// creates an exclusive reference to a footer. The free list, the counters and the bump index
/// belong to the owner alone.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Page {
    next: Cell<Option<NonNull<Page>>>,
    prev: Cell<Option<NonNull<Page>>>,

    free_list: Cell<Option<NonNull<FreeSlot>>>,

    /// Opaque identity of the engine that assigned the page to its bucket. The thread-local
    /// pool uses this to route frees from other threads to the owning thread.
    owner: Cell<Option<NonNull<()>>>,

    element_size: Cell<u32>,
    max_elements: Cell<u32>,
    used_elements: Cell<u32>,
    untouched_index: Cell<u32>,
    bucket_index: Cell<u32>,

    /// Guard value identifying the pool the page belongs to. Zero once the block has been
    /// returned to the page allocator.
    magic: Cell<u32>,
}

impl Page {
    /// Writes a fresh, unassigned footer.
    ///
    /// # Safety
    ///
    /// `footer` must be valid for writes of a `Page`, suitably aligned and located at the end of
    /// a page block. Any footer previously stored there must no longer be referenced.
    pub(crate) unsafe fn write_footer(footer: NonNull<Self>, magic: u32) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            footer.write(Self {
                next: Cell::new(None),
                prev: Cell::new(None),
                free_list: Cell::new(None),
                owner: Cell::new(None),
                element_size: Cell::new(0),
                max_elements: Cell::new(0),
                used_elements: Cell::new(0),
                untouched_index: Cell::new(0),
                bucket_index: Cell::new(UNASSIGNED_BUCKET),
                magic: Cell::new(magic),
            });
        }
    }

    /// # Safety
    ///
    /// `page` must point to an initialized footer that stays valid for `'a`.
    #[must_use]
    pub(crate) unsafe fn from_ptr<'a>(page: NonNull<Self>) -> &'a Self {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { page.as_ref() }
    }

    #[must_use]
    pub(crate) fn magic(&self) -> u32 {
        self.magic.get()
    }

    /// Clears the guard value, so that stale pointers into the block no longer validate.
    pub(crate) fn invalidate(&self) {
        self.magic.set(0);
    }

    #[must_use]
    pub(crate) fn is_assigned(&self) -> bool {
        self.bucket_index.get() != UNASSIGNED_BUCKET
    }

    #[must_use]
    pub(crate) fn bucket_index(&self) -> usize {
        self.bucket_index.get() as usize
    }

    #[must_use]
    pub(crate) fn element_size(&self) -> usize {
        self.element_size.get() as usize
    }

    #[must_use]
    pub(crate) fn owner(&self) -> Option<NonNull<()>> {
        self.owner.get()
    }

    #[must_use]
    pub(crate) fn used_elements(&self) -> usize {
        self.used_elements.get() as usize
    }

    #[must_use]
    pub(crate) fn is_full(&self) -> bool {
        self.used_elements.get() == self.max_elements.get()
    }

    #[must_use]
    pub(crate) fn is_unused(&self) -> bool {
        self.used_elements.get() == 0
    }

    /// Assigns an unassigned page to a bucket, making all of its slots available.
    ///
    /// # Panics
    ///
    /// Panics if the page is already assigned or the geometry does not fit the page bookkeeping.
    pub(crate) fn assign(
        &self,
        bucket_index: usize,
        element_size: usize,
        max_elements: usize,
        owner: Option<NonNull<()>>,
    ) {
        assert!(
            !self.is_assigned(),
            "page is already assigned to bucket {}",
            self.bucket_index.get()
        );
        assert!(max_elements > 0, "page must hold at least one slot");

        self.bucket_index.set(
            u32::try_from(bucket_index).expect("bucket count is bounded by the 32-bit page size"),
        );
        self.element_size.set(
            u32::try_from(element_size).expect("slot size is bounded by the 32-bit page size"),
        );
        self.max_elements.set(
            u32::try_from(max_elements).expect("slot count is bounded by the 32-bit page size"),
        );
        self.owner.set(owner);
        self.free_list.set(None);
        self.used_elements.set(0);
        self.untouched_index.set(0);
    }

    /// Detaches an unused page from its bucket so it can be cached or released.
    pub(crate) fn retire(&self) {
        debug_assert!(self.is_unused());

        self.bucket_index.set(UNASSIGNED_BUCKET);
        self.owner.set(None);
        self.free_list.set(None);
        self.untouched_index.set(0);
    }

    /// Takes a slot from the page, or returns `None` if every slot is in use.
    ///
    /// # Safety
    ///
    /// `block` must be the start of the block this footer belongs to and the page must be
    /// assigned.
    pub(crate) unsafe fn pop_slot(&self, block: NonNull<u8>) -> Option<NonNull<u8>> {
        let slot = if let Some(free) = self.free_list.get() {
            // SAFETY: Slots on the free list are unused and were linked by push_slot().
            self.free_list.set(unsafe { FreeSlot::next(free) });
            free.cast::<u8>()
        } else {
            let untouched_index = self.untouched_index.get();

            if untouched_index >= self.max_elements.get() {
                return None;
            }

            // Cannot overflow, slot count and sizes are bounded by the page size.
            let offset = (untouched_index as usize).wrapping_mul(self.element_size());
            self.untouched_index.set(untouched_index.wrapping_add(1));

            // SAFETY: The slot lies between the block start and the footer, guaranteed by the
            // slot count calculation when the page was assigned.
            unsafe { block.byte_add(offset) }
        };

        // Cannot overflow, bounded by max_elements.
        self.used_elements
            .set(self.used_elements.get().wrapping_add(1));

        Some(slot)
    }

    /// Returns a slot to the page.
    ///
    /// # Panics
    ///
    /// Panics if the page has no slots in use, which means a slot was returned twice.
    ///
    /// # Safety
    ///
    /// `slot` must have been handed out by [`pop_slot()`][Self::pop_slot] of this page and must
    /// no longer be used by the caller.
    pub(crate) unsafe fn push_slot(&self, slot: NonNull<u8>) {
        assert!(
            !self.is_unused(),
            "slot {slot:p} returned to a page that has no slots in use - double free?"
        );

        // SAFETY: Forwarding guarantees from the caller. Slots are aligned to at least the
        // minimum allocation size, which can hold a link.
        let link = unsafe { FreeSlot::write(slot, self.free_list.get()) };
        self.free_list.set(Some(link));

        self.used_elements
            .set(self.used_elements.get().wrapping_sub(1));
    }

    /// Index of the slot that starts at `address`, if any.
    ///
    /// Only reads fields that do not change while the page is assigned, so any thread holding
    /// a slot of the page may call this.
    #[must_use]
    #[expect(
        clippy::integer_division,
        clippy::modulo_arithmetic,
        reason = "slot index arithmetic on unsigned offsets"
    )]
    pub(crate) fn slot_index(&self, block: NonNull<u8>, address: NonNull<u8>) -> Option<usize> {
        let offset = address.addr().get().checked_sub(block.addr().get())?;
        let element_size = self.element_size();

        if element_size == 0 || offset % element_size != 0 {
            return None;
        }

        let index = offset / element_size;
        (index < self.max_elements.get() as usize).then_some(index)
    }

    /// Whether `address` is the start of a slot that this page has handed out at least once.
    ///
    /// Reads the bump index, which changes on every allocation, so only the owner of the page
    /// may call this.
    #[must_use]
    pub(crate) fn was_handed_out(&self, block: NonNull<u8>, address: NonNull<u8>) -> bool {
        self.slot_index(block, address)
            .is_some_and(|index| index < self.untouched_index.get() as usize)
    }
}

/// Intrusive doubly linked list of pages, threaded through the page footers.
///
/// The list does not own the pages. Whoever pushes a page guarantees it stays valid while
/// linked and that it is linked into at most one list at a time.
#[derive(Debug, Default)]
pub(crate) struct PageList {
    head: Option<NonNull<Page>>,
    tail: Option<NonNull<Page>>,
    len: usize,
}

// SAFETY: The list only stores pointers to page footers. Moving the list to another thread moves
// the right to work with those pages along with it.
unsafe impl Send for PageList {}

impl PageList {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub(crate) fn front(&self) -> Option<NonNull<Page>> {
        self.head
    }

    /// # Safety
    ///
    /// `page` must point to an initialized footer that is not linked into any list and stays
    /// valid while linked into this one.
    pub(crate) unsafe fn push_front(&mut self, page: NonNull<Page>) {
        // SAFETY: Guaranteed by the caller.
        let page_ref = unsafe { Page::from_ptr(page) };
        page_ref.prev.set(None);
        page_ref.next.set(self.head);

        match self.head {
            // SAFETY: Linked pages are valid, guaranteed by whoever pushed them.
            Some(head) => unsafe { Page::from_ptr(head) }.prev.set(Some(page)),
            None => self.tail = Some(page),
        }

        self.head = Some(page);
        // Cannot overflow, pages are distinct memory blocks.
        self.len = self.len.wrapping_add(1);
    }

    /// # Safety
    ///
    /// `page` must point to an initialized footer that is not linked into any list and stays
    /// valid while linked into this one.
    pub(crate) unsafe fn push_back(&mut self, page: NonNull<Page>) {
        // SAFETY: Guaranteed by the caller.
        let page_ref = unsafe { Page::from_ptr(page) };
        page_ref.next.set(None);
        page_ref.prev.set(self.tail);

        match self.tail {
            // SAFETY: Linked pages are valid, guaranteed by whoever pushed them.
            Some(tail) => unsafe { Page::from_ptr(tail) }.next.set(Some(page)),
            None => self.head = Some(page),
        }

        self.tail = Some(page);
        // Cannot overflow, pages are distinct memory blocks.
        self.len = self.len.wrapping_add(1);
    }

    /// # Safety
    ///
    /// `page` must be linked into this list.
    pub(crate) unsafe fn remove(&mut self, page: NonNull<Page>) {
        // SAFETY: Guaranteed by the caller.
        let page_ref = unsafe { Page::from_ptr(page) };
        let prev = page_ref.prev.take();
        let next = page_ref.next.take();

        match prev {
            // SAFETY: Linked pages are valid, guaranteed by whoever pushed them.
            Some(prev) => unsafe { Page::from_ptr(prev) }.next.set(next),
            None => self.head = next,
        }

        match next {
            // SAFETY: Linked pages are valid, guaranteed by whoever pushed them.
            Some(next) => unsafe { Page::from_ptr(next) }.prev.set(prev),
            None => self.tail = prev,
        }

        self.len = self
            .len
            .checked_sub(1)
            .expect("removed a page from an empty list");
    }

    pub(crate) fn pop_front(&mut self) -> Option<NonNull<Page>> {
        let head = self.head?;

        // SAFETY: The head is linked into this list.
        unsafe {
            self.remove(head);
        }

        Some(head)
    }

    /// Moves a linked page to the front of the list.
    ///
    /// # Safety
    ///
    /// `page` must be linked into this list.
    pub(crate) unsafe fn move_to_front(&mut self, page: NonNull<Page>) {
        if self.head == Some(page) {
            return;
        }

        // SAFETY: Forwarding guarantees from the caller, the page is unlinked in between.
        unsafe {
            self.remove(page);
            self.push_front(page);
        }
    }

    /// Moves a linked page to the back of the list.
    ///
    /// # Safety
    ///
    /// `page` must be linked into this list.
    pub(crate) unsafe fn move_to_back(&mut self, page: NonNull<Page>) {
        if self.tail == Some(page) {
            return;
        }

        // SAFETY: Forwarding guarantees from the caller, the page is unlinked in between.
        unsafe {
            self.remove(page);
            self.push_back(page);
        }
    }
}
