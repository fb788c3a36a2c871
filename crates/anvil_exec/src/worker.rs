use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::coordination::{self, Disposition, StateCoordinator};
use crate::error::{ExecutorError, failure};
use crate::health::{ExecutorState, WorkerRecord};
use crate::lease::{WorkerLease, WorkerLeaseRegistry};
use crate::queue::{MergedQueue, WorkItem};
use crate::source::{ExecutionState, Selection};
use crate::stats::WorkerStats;

// -----------------------------------------------------------------------------
// ExecutorWorker

/// The per-thread work loop: select a node under the state lock, run its
/// action outside it, report completion under the lock again, repeat.
///
/// Pool threads run this against the shared queue until it is closed; a
/// submitting thread runs it against a private queue holding only its own
/// plan, so it participates without stealing unrelated work.
pub(crate) struct ExecutorWorker {
    queue: Arc<MergedQueue>,
    /// The queue a source failure escalates to. For a pool worker this is the
    /// same as `queue`; for a submitting thread's worker it is the shared
    /// queue, so a broken source fails every live plan, not just its own.
    abort_queue: Arc<MergedQueue>,
    coordinator: Arc<StateCoordinator>,
    leases: Arc<WorkerLeaseRegistry>,
    cancellation: CancellationToken,
    executor_state: Arc<ExecutorState>,
}

impl ExecutorWorker {
    pub(crate) fn new(
        queue: Arc<MergedQueue>,
        abort_queue: Arc<MergedQueue>,
        coordinator: Arc<StateCoordinator>,
        leases: Arc<WorkerLeaseRegistry>,
        cancellation: CancellationToken,
        executor_state: Arc<ExecutorState>,
    ) -> Self {
        Self { queue, abort_queue, coordinator, leases, cancellation, executor_state }
    }

    /// Runs the loop until the queue has nothing more to start.
    ///
    /// `lease` is the calling thread's existing worker lease, or `None` for a
    /// pool thread, which allocates its own and gives it back on exit. An
    /// inherited lease is left exactly as the loop last used it: the
    /// submitting thread stays a worker after its plan drains.
    pub(crate) fn run(&self, lease: Option<Rc<WorkerLease>>, mut stats: WorkerStats) {
        let record = self.executor_state.register_worker();
        let (lease, owns_lease) = match lease {
            Some(lease) => (lease, false),
            None => (self.leases.new_worker_lease(), true),
        };

        let mut cancel_forwarded = false;
        loop {
            stats.select_started();
            let item = self.next_item(&lease, &record, &mut cancel_forwarded);
            stats.select_finished();
            let Some(item) = item else { break };
            self.execute_item(item, &mut stats);
        }

        if owns_lease {
            self.coordinator.run_locked(|| lease.unlock_if_held());
            self.leases.retire_worker_lease(&lease);
        }
        record.set_stopped();
        stats.worker_finished();
    }

    /// One scheduling decision. Returns `None` when the loop should exit.
    ///
    /// Parks on the coordinator while nodes remain but none are ready. When
    /// the worker-lease bound is the only obstacle there is no waiting state:
    /// some other worker holds a lease and is making progress.
    fn next_item(
        &self,
        lease: &Rc<WorkerLease>,
        record: &WorkerRecord,
        cancel_forwarded: &mut bool,
    ) -> Option<WorkItem> {
        self.coordinator.with_state_lock(|| {
            record.set_running();
            if self.cancellation.is_cancelled() && !*cancel_forwarded {
                self.queue.cancel_execution();
                *cancel_forwarded = true;
            }

            match self.queue.execution_state() {
                ExecutionState::NoMoreWorkToStart => return Disposition::Finished(None),
                ExecutionState::NoWorkReadyToStart => {
                    record.set_waiting();
                    lease.unlock_if_held();
                    return Disposition::Retry;
                }
                ExecutionState::MaybeWorkReadyToStart => {}
            }

            let newly_locked = if lease.is_held() {
                false
            } else if lease.try_lock() {
                true
            } else {
                return Disposition::Retry;
            };

            match self.queue.select_next() {
                Ok(Selection::Item(item)) => Disposition::Finished(Some(item)),
                Ok(Selection::NoMoreWorkToStart) => Disposition::Finished(None),
                Ok(Selection::NoWorkReadyToStart) => {
                    record.set_waiting();
                    lease.unlock_if_held();
                    Disposition::Retry
                }
                Err(source_failure) => {
                    // The source is broken; fail every plan coherently rather
                    // than leaving siblings waiting forever.
                    coordination::release_current_attempt_locks();
                    if newly_locked {
                        lease.unlock();
                    }
                    log::error!(
                        "a work source failed during selection, aborting all queued work: {source_failure}"
                    );
                    self.abort_queue.abort_all_and_fail(source_failure);
                    Disposition::Finished(None)
                }
            }
        })
    }

    /// Runs one selected node outside the lock and reports its outcome.
    fn execute_item(&self, item: WorkItem, stats: &mut WorkerStats) {
        let WorkItem { mut node, plan } = item;

        let started = stats.clock();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| plan.run_action(&mut *node)));
        let node_failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(action_failure)) => Some(action_failure),
            Err(payload) => Some(failure(ExecutorError::ActionPanicked {
                message: panic_message(payload.as_ref()),
            })),
        };
        stats.add_execute(started);

        let started = stats.clock();
        self.coordinator.run_locked(|| {
            if let Err(source_failure) = plan.finished_executing(node, node_failure) {
                log::error!(
                    "a work source failed while completing a node, aborting all queued work: {source_failure}"
                );
                self.abort_queue.abort_all_and_fail(source_failure);
            }
            self.coordinator.notify_state_change();
        });
        stats.add_mark_finished(started);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

// -----------------------------------------------------------------------------
// Tests
