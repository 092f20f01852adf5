use std::cell::{RefCell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{FreedElements, FreedElementsStack, PoolEngine, PoolLayout};

/// The part of a [`ThreadPoolSchema`][crate::ThreadPoolSchema] that belongs to one thread.
///
/// Each thread that allocates from a thread pool gets its own engine, so the allocation path
/// never takes a lock. Slots freed by other threads are pushed onto `freed_elements` and folded
/// back into the engine by the owning thread on its next allocation.
///
/// The data is shared between the schema (which keeps every thread's data alive until the
/// schema is dropped) and the thread-local bindings of the owning thread. Pages assigned by the
/// engine record the address of this struct as their owner, which is how a freeing thread finds
/// the stack to push onto.
///
/// # Engine access
///
/// The engine may only be touched by the owning thread while the owner is alive. Once the owner
/// has exited (or before the data is ever shared), the engine may be touched by whoever holds the
/// schema's coarse lock, or by the schema's destructor.
#[derive(Debug)]
pub(crate) struct ThreadPoolData {
    schema_id: u64,

    engine: UnsafeCell<PoolEngine>,

    freed_elements: FreedElementsStack,

    /// Slot bytes held by the engine, published after every engine operation so that other
    /// threads can sum up the pool's usage without touching the engine.
    allocated_bytes: AtomicUsize,

    /// Set by the owning thread's thread-local destructor. Release/acquire ordered so that
    /// whoever sees it also sees every engine mutation the owner made.
    owner_exited: AtomicBool,

    /// Set when the schema is dropped, so stale thread-local bindings can be pruned.
    detached: AtomicBool,
}

// SAFETY: The engine is only accessed under the rules documented on the type, which guarantee
// exclusive access. Everything else is atomic.
unsafe impl Send for ThreadPoolData {}

// SAFETY: See above.
unsafe impl Sync for ThreadPoolData {}

impl ThreadPoolData {
    pub(crate) fn new(schema_id: u64, layout: PoolLayout, keep_spare_pages: bool) -> Arc<Self> {
        let data = Arc::new(Self {
            schema_id,
            engine: UnsafeCell::new(PoolEngine::new(layout, keep_spare_pages)),
            freed_elements: FreedElementsStack::new(),
            allocated_bytes: AtomicUsize::new(0),
            owner_exited: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });

        let identity = data.identity();

        // SAFETY: The data has not been shared yet, so nobody else can access the engine.
        unsafe {
            data.with_engine(|engine| engine.set_owner(identity));
        }

        data
    }

    #[must_use]
    pub(crate) fn schema_id(&self) -> u64 {
        self.schema_id
    }

    /// The owner value that the engine stamps into the pages it assigns.
    #[must_use]
    pub(crate) fn identity(&self) -> NonNull<()> {
        NonNull::from(self).cast::<()>()
    }

    /// Resolves the owner value of a page back to the thread data.
    ///
    /// # Safety
    ///
    /// `identity` must have been obtained from [`identity()`][Self::identity] of thread data that
    /// is still alive for `'a`. The schema keeps all of its thread data alive until it is dropped.
    #[must_use]
    pub(crate) unsafe fn from_identity<'a>(identity: NonNull<()>) -> &'a Self {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { identity.cast::<Self>().as_ref() }
    }

    /// Runs `f` with exclusive access to the engine.
    ///
    /// # Safety
    ///
    /// The caller must have the right to access the engine, as documented on the type, and `f`
    /// must not call back into `with_engine()` of the same data.
    pub(crate) unsafe fn with_engine<R>(&self, f: impl FnOnce(&mut PoolEngine) -> R) -> R {
        // SAFETY: Forwarding guarantees from the caller.
        let engine = unsafe { &mut *self.engine.get() };

        let result = f(&mut *engine);

        self.allocated_bytes
            .store(engine.num_allocated_bytes(), Ordering::Relaxed);

        result
    }

    /// Hands a slot freed by another thread to the owner of its page.
    ///
    /// # Safety
    ///
    /// `slot` must be an allocated slot of a page assigned by this data's engine and must not be
    /// used afterwards.
    pub(crate) unsafe fn push_remote_free(&self, slot: NonNull<u8>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            self.freed_elements.push(slot);
        }
    }

    #[must_use]
    pub(crate) fn has_remote_frees(&self) -> bool {
        !self.freed_elements.is_empty()
    }

    /// # Safety
    ///
    /// The caller must have the right to access the engine, as documented on the type.
    pub(crate) unsafe fn take_remote_frees(&self) -> FreedElements {
        // SAFETY: Engine access rights imply that we are the single consumer.
        unsafe { self.freed_elements.take_all() }
    }

    /// Slot bytes held by the engine as of its last operation. Slots freed by other threads
    /// count as allocated until the owner reconciles them.
    #[must_use]
    pub(crate) fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_owner_exited(&self) {
        self.owner_exited.store(true, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn owner_exited(&self) -> bool {
        self.owner_exited.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }
}

/// The thread data of every thread pool the current thread has allocated from.
#[derive(Debug, Default)]
struct ThreadBindings {
    entries: Vec<Arc<ThreadPoolData>>,
}

impl Drop for ThreadBindings {
    fn drop(&mut self) {
        for data in &self.entries {
            data.mark_owner_exited();
        }
    }
}

thread_local! {
    static BINDINGS: RefCell<ThreadBindings> = RefCell::new(ThreadBindings::default());
}

/// Runs `f` with the current thread's data for the given schema.
///
/// Returns `None` if the current thread has no data for the schema yet, or if the thread is
/// already tearing down its thread-local storage.
pub(crate) fn with_current<R>(schema_id: u64, f: impl FnOnce(&ThreadPoolData) -> R) -> Option<R> {
    BINDINGS
        .try_with(|bindings| {
            let bindings = bindings.try_borrow().ok()?;

            let data = bindings
                .entries
                .iter()
                .find(|data| data.schema_id() == schema_id)?;

            Some(f(data))
        })
        .ok()
        .flatten()
}

/// Binds thread data to the current thread, pruning bindings of dropped schemas.
///
/// Returns `false` if the thread is already tearing down its thread-local storage, in which case
/// the data is not bound.
#[must_use]
pub(crate) fn bind_current(data: Arc<ThreadPoolData>) -> bool {
    BINDINGS
        .try_with(|bindings| {
            let Ok(mut bindings) = bindings.try_borrow_mut() else {
                return false;
            };

            bindings.entries.retain(|existing| !existing.is_detached());
            bindings.entries.push(data);
            true
        })
        .unwrap_or(false)
}
