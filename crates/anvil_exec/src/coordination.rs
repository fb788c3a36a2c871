//! The coordination service: one re-entrant state lock and one condition
//! variable shared by every worker of a build.
//!
//! All scheduling state (the merged queue, worker leases, resource locks,
//! worker records) is only mutated while a thread owns the state lock, so the
//! individual structures get away with uncontended interior mutexes. The
//! condition variable carries both "the lock is free" and "the guarded state
//! changed" wakeups.

use std::cell::RefCell;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::resource::LockHold;

// -----------------------------------------------------------------------------
// Disposition

/// Outcome of one attempt of a [`StateCoordinator::with_state_lock`] body.
#[must_use]
pub enum Disposition<T> {
    /// The body completed; release the state lock and return the value.
    Finished(T),
    /// The body cannot make progress yet. The state lock and any resource
    /// locks the attempt acquired are released, and the body runs again after
    /// the next state change.
    Retry,
}

// -----------------------------------------------------------------------------
// Attempt tracking

thread_local! {
    /// Resource-lock acquisitions made by the state-lock bodies currently on
    /// this thread's stack, innermost last.
    static ATTEMPTS: RefCell<Vec<Vec<LockHold>>> = const { RefCell::new(Vec::new()) };
}

fn push_attempt() {
    ATTEMPTS.with(|attempts| attempts.borrow_mut().push(Vec::new()));
}

fn pop_attempt() -> Vec<LockHold> {
    ATTEMPTS.with(|attempts| attempts.borrow_mut().pop()).unwrap_or_default()
}

/// Records a successful resource-lock acquisition against the innermost
/// attempt, so a retry can roll it back.
pub(crate) fn record_lock_acquired(hold: LockHold) {
    ATTEMPTS.with(|attempts| {
        if let Some(attempt) = attempts.borrow_mut().last_mut() {
            attempt.push(hold);
        }
    });
}

/// Forgets one recorded acquisition after an explicit unlock, so rollback
/// never double-releases.
pub(crate) fn record_lock_released(hold: &LockHold) {
    ATTEMPTS.with(|attempts| {
        if let Some(attempt) = attempts.borrow_mut().last_mut()
            && let Some(index) = attempt.iter().rposition(|held| held.is_same_lock(hold))
        {
            attempt.remove(index);
        }
    });
}

/// Releases every resource lock the innermost attempt acquired, newest first.
pub(crate) fn release_current_attempt_locks() {
    let acquired = ATTEMPTS.with(|attempts| {
        attempts
            .borrow_mut()
            .last_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    });
    for hold in acquired.into_iter().rev() {
        hold.release();
    }
}

// -----------------------------------------------------------------------------
// StateCoordinator

struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Mutual exclusion over the build's scheduling state, plus a broadcast
/// wakeup for workers parked on that state.
///
/// The lock is re-entrant: a thread that owns it may take it again. A body
/// passed to [`with_state_lock`] may answer [`Disposition::Retry`] to park
/// until [`notify_state_change`] and run again.
///
/// [`with_state_lock`]: Self::with_state_lock
/// [`notify_state_change`]: Self::notify_state_change
pub struct StateCoordinator {
    owner: Mutex<Owner>,
    cond: Condvar,
}

impl StateCoordinator {
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(Owner { thread: None, depth: 0 }),
            cond: Condvar::new(),
        }
    }

    /// Runs `body` under the state lock until it answers
    /// [`Disposition::Finished`].
    ///
    /// A [`Disposition::Retry`] releases the resource locks the attempt
    /// acquired, parks the thread on the condition variable, and runs `body`
    /// again after the next state change. Spurious wakeups only cost an extra
    /// run of `body`.
    pub fn with_state_lock<T>(&self, mut body: impl FnMut() -> Disposition<T>) -> T {
        loop {
            self.acquire();
            push_attempt();
            let mut guard = AttemptGuard { coordinator: self, completed: false };
            let disposition = body();
            guard.completed = true;
            drop(guard);
            match disposition {
                Disposition::Finished(value) => {
                    // Locks acquired by a finishing attempt stay held.
                    pop_attempt();
                    self.release();
                    return value;
                }
                Disposition::Retry => {
                    release_current_attempt_locks();
                    pop_attempt();
                    self.release_all_and_wait();
                }
            }
        }
    }

    /// Runs `f` once under the state lock, for callers with no retry path.
    pub fn run_locked<T>(&self, f: impl FnOnce() -> T) -> T {
        self.acquire();
        push_attempt();
        let mut guard = AttemptGuard { coordinator: self, completed: false };
        let value = f();
        guard.completed = true;
        drop(guard);
        pop_attempt();
        self.release();
        value
    }

    /// Wakes every thread parked on the coordinator, both lock waiters and
    /// [`Disposition::Retry`] sleepers.
    pub fn notify_state_change(&self) {
        let _owner = self.lock_owner();
        self.cond.notify_all();
    }

    /// Whether the calling thread owns the state lock.
    pub fn is_state_lock_held(&self) -> bool {
        self.lock_owner().thread == Some(thread::current().id())
    }

    /// Panics unless the calling thread owns the state lock. Scheduling-state
    /// operations call this as a contract check.
    pub fn assert_state_lock_held(&self) {
        if !self.is_state_lock_held() {
            panic!("the current thread does not hold the state lock");
        }
    }

    fn lock_owner(&self) -> std::sync::MutexGuard<'_, Owner> {
        // The owner record is a plain pair, safe to reuse after a panic.
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) {
        let me = thread::current().id();
        let mut owner = self.lock_owner();
        loop {
            match owner.thread {
                Some(thread) if thread == me => {
                    owner.depth += 1;
                    return;
                }
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    return;
                }
                Some(_) => {
                    owner = self.cond.wait(owner).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn release(&self) {
        let me = thread::current().id();
        let mut owner = self.lock_owner();
        debug_assert_eq!(owner.thread, Some(me));
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            self.cond.notify_all();
        }
    }

    /// Atomically gives up the full re-entrant hold and parks until the next
    /// notification, then re-acquires at the saved depth.
    fn release_all_and_wait(&self) {
        let me = thread::current().id();
        let mut owner = self.lock_owner();
        debug_assert_eq!(owner.thread, Some(me));
        let depth = owner.depth;
        owner.thread = None;
        owner.depth = 0;
        self.cond.notify_all();

        owner = self.cond.wait(owner).unwrap_or_else(PoisonError::into_inner);
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = depth;
                    return;
                }
                Some(_) => {
                    owner = self.cond.wait(owner).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the coordinator when a state-lock body panics: the attempt's
/// resource locks are released and the hold for this frame is given back, so
/// other workers are not wedged behind a dead owner.
struct AttemptGuard<'a> {
    coordinator: &'a StateCoordinator,
    completed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        release_current_attempt_locks();
        pop_attempt();
        self.coordinator.release();
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

    use super::{Disposition, StateCoordinator};

    #[test]
    fn reentrant_from_the_same_thread() {
        let coordinator = StateCoordinator::new();
        let value = coordinator.run_locked(|| {
            coordinator.assert_state_lock_held();
            coordinator.run_locked(|| {
                coordinator.assert_state_lock_held();
                7
            })
        });
        assert_eq!(value, 7);
        assert!(!coordinator.is_state_lock_held());
    }

    #[test]
    fn retry_parks_until_notified() {
        let coordinator = Arc::new(StateCoordinator::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let turnstile = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let coordinator = coordinator.clone();
            let attempts = attempts.clone();
            let turnstile = turnstile.clone();
            thread::spawn(move || {
                coordinator.with_state_lock(|| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if turnstile.load(Ordering::SeqCst) == 0 {
                        Disposition::Retry
                    } else {
                        Disposition::Finished(())
                    }
                });
            })
        };

        // Let the waiter park at least once.
        while attempts.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));

        turnstile.store(1, Ordering::SeqCst);
        coordinator.notify_state_change();

        waiter.join().unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn lock_excludes_other_threads() {
        let coordinator = Arc::new(StateCoordinator::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        coordinator.run_locked(|| {
                            let seen = counter.load(Ordering::Relaxed);
                            thread::yield_now();
                            counter.store(seen + 1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 400);
    }

    #[test]
    #[should_panic(expected = "does not hold the state lock")]
    fn assert_without_lock_panics() {
        StateCoordinator::new().assert_state_lock_held();
    }
}
