use std::ptr::NonNull;

use crate::{Page, PageList};

/// The pages currently serving one size class.
///
/// Pages with at least one vacant slot are kept in front of full pages, so the front page
/// tells us whether the bucket can serve an allocation without obtaining a new page.
/// A page that becomes entirely unused only stays in the bucket if it is the bucket's last
/// page. An unused page in a bucket is therefore always its only page.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    pages: PageList,
}

impl Bucket {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            pages: PageList::new(),
        }
    }

    /// The page to allocate from, if the bucket has a page with a vacant slot.
    #[must_use]
    pub(crate) fn page_with_vacancy(&self) -> Option<NonNull<Page>> {
        let page = self.pages.front()?;

        // SAFETY: Pages linked into the bucket are valid until removed.
        let has_vacancy = !unsafe { Page::from_ptr(page) }.is_full();
        has_vacancy.then_some(page)
    }

    #[must_use]
    pub(crate) fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// # Safety
    ///
    /// `page` must be a valid, assigned page that is not linked into any list.
    pub(crate) unsafe fn add_page(&mut self, page: NonNull<Page>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.pages.push_front(page) };
    }

    /// Records that the last vacant slot of `page` was taken.
    ///
    /// # Safety
    ///
    /// `page` must be linked into this bucket.
    pub(crate) unsafe fn page_filled(&mut self, page: NonNull<Page>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.pages.move_to_back(page) };
    }

    /// Records that a previously full `page` has a vacant slot again.
    ///
    /// # Safety
    ///
    /// `page` must be linked into this bucket.
    pub(crate) unsafe fn page_vacated(&mut self, page: NonNull<Page>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.pages.move_to_front(page) };
    }

    /// # Safety
    ///
    /// `page` must be linked into this bucket.
    pub(crate) unsafe fn remove_page(&mut self, page: NonNull<Page>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.pages.remove(page) };
    }

    /// Unlinks the bucket's page if it has no used slots.
    pub(crate) fn take_unused_page(&mut self) -> Option<NonNull<Page>> {
        let page = self.pages.front()?;

        // SAFETY: Pages linked into the bucket are valid until removed.
        if !unsafe { Page::from_ptr(page) }.is_unused() {
            return None;
        }

        // SAFETY: The page was just found at the front of the bucket.
        unsafe { self.pages.remove(page) };

        Some(page)
    }

    /// Unlinks any page of the bucket, used when tearing the pool down.
    pub(crate) fn pop_page(&mut self) -> Option<NonNull<Page>> {
        self.pages.pop_front()
    }
}
