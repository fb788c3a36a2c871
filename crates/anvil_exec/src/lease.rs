use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::coordination::StateCoordinator;

// -----------------------------------------------------------------------------
// WorkerLeaseRegistry

thread_local! {
    /// The worker leases handed to this thread, newest last. A thread keeps at
    /// most one lease per registry; nested plan submissions look their lease
    /// up here instead of allocating a second one.
    static THREAD_LEASES: RefCell<Vec<Rc<WorkerLease>>> = const { RefCell::new(Vec::new()) };
}

/// Hands out the `N` worker leases of a build.
///
/// A thread must hold a locked lease while it runs a node's action; at most
/// `N` leases are locked at any instant, which bounds the build's real
/// concurrency regardless of how many threads exist.
pub struct WorkerLeaseRegistry {
    counter: Arc<LeaseCounter>,
}

struct LeaseCounter {
    coordinator: Arc<StateCoordinator>,
    max_leases: usize,
    locked: AtomicUsize,
}

impl WorkerLeaseRegistry {
    pub fn new(coordinator: Arc<StateCoordinator>, max_leases: usize) -> Self {
        Self {
            counter: Arc::new(LeaseCounter {
                coordinator,
                max_leases,
                locked: AtomicUsize::new(0),
            }),
        }
    }

    /// The bound `N`.
    #[inline]
    pub fn max_leases(&self) -> usize {
        self.counter.max_leases
    }

    /// How many leases are locked right now.
    #[inline]
    pub fn leases_locked(&self) -> usize {
        self.counter.locked.load(Ordering::Relaxed)
    }

    /// Returns a fresh, unlocked lease tied to the calling thread and records
    /// it as the thread's current lease.
    pub fn new_worker_lease(&self) -> Rc<WorkerLease> {
        let lease = Rc::new(WorkerLease {
            counter: self.counter.clone(),
            held: Cell::new(false),
        });
        THREAD_LEASES.with(|leases| leases.borrow_mut().push(lease.clone()));
        lease
    }

    /// The lease the calling thread already owns from this registry, if any.
    pub fn current_worker_lease(&self) -> Option<Rc<WorkerLease>> {
        THREAD_LEASES.with(|leases| {
            leases
                .borrow()
                .iter()
                .rev()
                .find(|lease| Arc::ptr_eq(&lease.counter, &self.counter))
                .cloned()
        })
    }

    /// Drops a lease from the calling thread's records. Pool workers retire
    /// their lease when their loop ends; the submitting thread keeps its lease
    /// for the lifetime of the build.
    pub(crate) fn retire_worker_lease(&self, lease: &Rc<WorkerLease>) {
        THREAD_LEASES.with(|leases| {
            let mut leases = leases.borrow_mut();
            if let Some(index) = leases.iter().rposition(|held| Rc::ptr_eq(held, lease)) {
                leases.remove(index);
            }
        });
    }
}

// -----------------------------------------------------------------------------
// WorkerLease

/// A claim on one of the `N` worker slots.
///
/// The handle is thread-bound: it lives on the thread that created it, and the
/// `held` flag is only ever read or written by that thread while it owns the
/// state lock.
pub struct WorkerLease {
    counter: Arc<LeaseCounter>,
    held: Cell<bool>,
}

impl WorkerLease {
    /// Non-blocking acquire. Must be called with the state lock held.
    ///
    /// Returns `false` when all `N` slots are taken, in which case the caller
    /// should yield and retry after the next state change.
    pub fn try_lock(&self) -> bool {
        self.counter.coordinator.assert_state_lock_held();
        debug_assert!(!self.held.get(), "worker lease is already locked by this thread");
        if self.counter.try_acquire() {
            self.held.set(true);
            true
        } else {
            false
        }
    }

    /// Releases the slot and wakes one of the threads waiting for a lease.
    /// Must be called with the state lock held so the wakeup is atomic with
    /// the release.
    pub fn unlock(&self) {
        self.counter.coordinator.assert_state_lock_held();
        assert!(self.held.get(), "unlocking a worker lease that is not held");
        self.held.set(false);
        self.counter.release();
    }

    /// [`unlock`](Self::unlock), tolerating a lease that is not held.
    pub(crate) fn unlock_if_held(&self) {
        if self.held.get() {
            self.unlock();
        }
    }

    /// Whether this handle currently holds a slot.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.get()
    }
}

impl LeaseCounter {
    // The counter is only touched under the state lock, so the load/store
    // pairs below cannot race.
    fn try_acquire(&self) -> bool {
        let locked = self.locked.load(Ordering::Relaxed);
        if locked < self.max_leases {
            self.locked.store(locked + 1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn release(&self) {
        let locked = self.locked.load(Ordering::Relaxed);
        debug_assert!(locked > 0);
        self.locked.store(locked - 1, Ordering::Relaxed);
        self.coordinator.notify_state_change();
    }
}

// -----------------------------------------------------------------------------
// Tests
