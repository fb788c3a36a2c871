use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anvil_utils::hash::HashMap;

use crate::coordination::{self, StateCoordinator};

// -----------------------------------------------------------------------------
// ResourceLock

/// A coarse-grained lock a node declares: a named shared resource with a fixed
/// concurrency, or a per-project mutex.
///
/// Handles are cheap clones of the same underlying lock. Work sources acquire
/// a node's locks during `select_next` (under the state lock) and release them
/// when the node finishes; the executor rolls back acquisitions made by a
/// scheduling attempt that yields.
#[derive(Clone)]
pub struct ResourceLock {
    state: Arc<LockState>,
}

struct LockState {
    name: String,
    max_holders: usize,
    // Only touched under the state lock; the load/store pairs cannot race.
    holders: AtomicUsize,
    coordinator: Arc<StateCoordinator>,
}

impl ResourceLock {
    fn new(name: String, max_holders: usize, coordinator: Arc<StateCoordinator>) -> Self {
        Self {
            state: Arc::new(LockState {
                name,
                max_holders,
                holders: AtomicUsize::new(0),
                coordinator,
            }),
        }
    }

    /// The resource name or project path this lock guards.
    #[inline]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// How many holders the lock admits at once.
    #[inline]
    pub fn max_holders(&self) -> usize {
        self.state.max_holders
    }

    /// Whether anyone holds the lock right now.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.holders.load(Ordering::Relaxed) > 0
    }

    /// Non-blocking acquire of one hold. Must be called with the state lock
    /// held. A successful acquisition is recorded against the current
    /// scheduling attempt and rolled back if that attempt yields.
    pub fn try_lock(&self) -> bool {
        self.state.coordinator.assert_state_lock_held();
        let holders = self.state.holders.load(Ordering::Relaxed);
        if holders == self.state.max_holders {
            return false;
        }
        self.state.holders.store(holders + 1, Ordering::Relaxed);
        coordination::record_lock_acquired(LockHold { state: self.state.clone() });
        true
    }

    /// Releases one hold and wakes waiting workers. Must be called with the
    /// state lock held.
    pub fn unlock(&self) {
        self.state.coordinator.assert_state_lock_held();
        coordination::record_lock_released(&LockHold { state: self.state.clone() });
        self.state.release_one();
    }
}

impl LockState {
    /// Drops one hold: the explicit-unlock path and the rollback path both end
    /// here.
    fn release_one(&self) {
        let holders = self.holders.load(Ordering::Relaxed);
        assert!(holders > 0, "resource lock `{}` is not held", self.name);
        self.holders.store(holders - 1, Ordering::Relaxed);
        self.coordinator.notify_state_change();
    }
}

// -----------------------------------------------------------------------------
// LockHold

/// One recorded acquisition of a [`ResourceLock`], owned by the scheduling
/// attempt that made it.
pub(crate) struct LockHold {
    state: Arc<LockState>,
}

impl LockHold {
    pub(crate) fn is_same_lock(&self, other: &LockHold) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn release(self) {
        self.state.release_one();
    }
}

// -----------------------------------------------------------------------------
// ResourceLockRegistry

/// Issues the shared locks nodes declare. One instance lives for the duration
/// of a build, owned by the executor.
pub struct ResourceLockRegistry {
    coordinator: Arc<StateCoordinator>,
    resources: Mutex<HashMap<String, ResourceLock>>,
    projects: Mutex<HashMap<String, ResourceLock>>,
}

impl ResourceLockRegistry {
    pub fn new(coordinator: Arc<StateCoordinator>) -> Self {
        Self {
            coordinator,
            resources: Mutex::new(HashMap::default()),
            projects: Mutex::new(HashMap::default()),
        }
    }

    /// The lock for a named shared resource admitting `max_concurrency`
    /// simultaneous holders.
    ///
    /// The first declaration fixes the width; later lookups return the
    /// existing lock no matter what width they ask for, since widening a lock
    /// that already has holders would break its exclusion guarantee.
    pub fn shared_resource(&self, name: &str, max_concurrency: usize) -> ResourceLock {
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = resources.get(name) {
            return lock.clone();
        }
        let lock = ResourceLock::new(
            name.to_owned(),
            max_concurrency.max(1),
            self.coordinator.clone(),
        );
        resources.insert(name.to_owned(), lock.clone());
        lock
    }

    /// The mutex serializing non-isolated work within one project. Isolated
    /// nodes simply never ask for one.
    pub fn project_lock(&self, project_path: &str) -> ResourceLock {
        let mut projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = projects.get(project_path) {
            return lock.clone();
        }
        let lock = ResourceLock::new(project_path.to_owned(), 1, self.coordinator.clone());
        projects.insert(project_path.to_owned(), lock.clone());
        lock
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::ResourceLockRegistry;
    use crate::coordination::{Disposition, StateCoordinator};

    #[test]
    fn width_one_is_exclusive() {
        let coordinator = Arc::new(StateCoordinator::new());
        let registry = ResourceLockRegistry::new(coordinator.clone());
        let lock = registry.project_lock(":app");

        coordinator.run_locked(|| {
            assert!(lock.try_lock());
            assert!(!lock.try_lock());
            lock.unlock();
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn first_declaration_fixes_the_width() {
        let coordinator = Arc::new(StateCoordinator::new());
        let registry = ResourceLockRegistry::new(coordinator);

        let narrow = registry.shared_resource("test-fixture", 1);
        let widened = registry.shared_resource("test-fixture", 8);
        assert_eq!(widened.max_holders(), 1);
        assert_eq!(narrow.max_holders(), 1);
    }

    #[test]
    fn yielding_attempt_rolls_back_its_locks() {
        let coordinator = Arc::new(StateCoordinator::new());
        let registry = ResourceLockRegistry::new(coordinator.clone());
        let lock = registry.shared_resource("compiler-daemon", 1);
        let attempts = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let coordinator = coordinator.clone();
            let lock = lock.clone();
            let attempts = attempts.clone();
            thread::spawn(move || {
                coordinator.with_state_lock(|| {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Take the lock, then yield: the acquisition must not
                        // survive the retry.
                        assert!(lock.try_lock());
                        Disposition::Retry
                    } else {
                        Disposition::Finished(())
                    }
                });
            })
        };

        while attempts.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));

        coordinator.run_locked(|| {
            assert!(!lock.is_locked());
        });
        coordinator.notify_state_change();
        waiter.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn explicit_unlock_is_not_rolled_back_twice() {
        let coordinator = Arc::new(StateCoordinator::new());
        let registry = ResourceLockRegistry::new(coordinator.clone());
        let lock = registry.shared_resource("download-pool", 2);

        // Lock twice, unlock once explicitly, then yield out of the attempt:
        // rollback must release only the remaining hold.
        let attempts = Arc::new(AtomicUsize::new(0));
        let lock_for_thread = lock.clone();
        let attempts_for_thread = attempts.clone();
        let coordinator_for_thread = coordinator.clone();
        let waiter = thread::spawn(move || {
            coordinator_for_thread.with_state_lock(|| {
                if attempts_for_thread.fetch_add(1, Ordering::SeqCst) == 0 {
                    assert!(lock_for_thread.try_lock());
                    assert!(lock_for_thread.try_lock());
                    lock_for_thread.unlock();
                    Disposition::Retry
                } else {
                    Disposition::Finished(())
                }
            });
        });

        while attempts.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));

        coordinator.run_locked(|| assert!(!lock.is_locked()));
        coordinator.notify_state_change();
        waiter.join().unwrap();
    }
}
