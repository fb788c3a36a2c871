use std::fmt::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::coordination::StateCoordinator;
use crate::error::{ExecutorError, failure};
use crate::queue::MergedQueue;

// -----------------------------------------------------------------------------
// Worker records

/// Lifecycle of one executor worker.
///
/// `Running` covers both "holding the state lock making a scheduling decision"
/// and "executing a node's action"; `Waiting` means parked on the coordinator
/// with no worker lease; `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Running,
    Waiting,
    Stopped,
}

/// Shared record of one worker's current state.
pub(crate) struct WorkerRecord {
    state: AtomicU8,
}

const RUNNING: u8 = 0;
const WAITING: u8 = 1;
const STOPPED: u8 = 2;

impl WorkerRecord {
    fn new() -> Self {
        Self { state: AtomicU8::new(RUNNING) }
    }

    pub(crate) fn set_running(&self) {
        self.state.store(RUNNING, Ordering::Relaxed);
    }

    pub(crate) fn set_waiting(&self) {
        self.state.store(WAITING, Ordering::Relaxed);
    }

    pub(crate) fn set_stopped(&self) {
        self.state.store(STOPPED, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> WorkerState {
        match self.state.load(Ordering::Relaxed) {
            RUNNING => WorkerState::Running,
            WAITING => WorkerState::Waiting,
            _ => WorkerState::Stopped,
        }
    }
}

// -----------------------------------------------------------------------------
// ExecutorState

/// Tracks every worker that ever joined this executor, for the liveness
/// check. Records are kept after a worker stops so the diagnostic can report
/// stopped counts.
pub(crate) struct ExecutorState {
    workers: Mutex<Vec<Arc<WorkerRecord>>>,
}

impl ExecutorState {
    pub(crate) fn new() -> Self {
        Self { workers: Mutex::new(Vec::new()) }
    }

    pub(crate) fn register_worker(&self) -> Arc<WorkerRecord> {
        let record = Arc::new(WorkerRecord::new());
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        record
    }

    /// The liveness rule. Must run under the state lock.
    ///
    /// Healthy when: nothing is queued; or no worker has joined yet (the pool
    /// is still starting); or at least one worker is running. Otherwise work
    /// is queued with every worker parked or gone, which can never resolve:
    /// the diagnostic is logged and every queued source is failed with it.
    pub(crate) fn assert_healthy(
        &self,
        coordinator: &StateCoordinator,
        queue: &MergedQueue,
    ) -> Result<(), ExecutorError> {
        coordinator.assert_state_lock_held();
        if queue.nothing_queued() {
            return Ok(());
        }
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            return Ok(());
        }
        let mut waiting = 0_usize;
        let mut stopped = 0_usize;
        for worker in workers.iter() {
            match worker.state() {
                WorkerState::Running => return Ok(()),
                WorkerState::Waiting => waiting += 1,
                WorkerState::Stopped => stopped += 1,
            }
        }
        drop(workers);

        let message = no_progress_message(queue, waiting, stopped);
        log::error!("{message}");
        let error = ExecutorError::NoProgress(message);
        queue.abort_all_and_fail(failure(error.clone()));
        Err(error)
    }
}

fn no_progress_message(queue: &MergedQueue, waiting: usize, stopped: usize) -> String {
    let mut message = String::from(
        "Unable to make progress running work. The following items are queued for execution but none are currently running:\n",
    );
    for diagnostics in queue.health_diagnostics() {
        let _ = write!(&mut message, "{diagnostics}");
    }
    let _ = write!(
        &mut message,
        "- {waiting} workers are waiting for work, {stopped} workers have stopped"
    );
    message
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ExecutorState, WorkerState};
    use crate::coordination::StateCoordinator;
    use crate::error::{ExecutorError, Failure};
    use crate::queue::{MergedQueue, PlanDetails};
    use crate::source::{ExecutionState, Selection, SourceDiagnostics, WorkSource};

    /// A source with one permanently blocked node.
    struct StuckSource {
        aborted: bool,
        failures: Vec<Failure>,
    }

    impl WorkSource for StuckSource {
        type Node = ();

        fn display_name(&self) -> String {
            "stuck source".to_owned()
        }

        fn execution_state(&mut self) -> ExecutionState {
            if self.aborted {
                ExecutionState::NoMoreWorkToStart
            } else {
                ExecutionState::NoWorkReadyToStart
            }
        }

        fn select_next(&mut self) -> Result<Selection<()>, Failure> {
            Ok(Selection::NoWorkReadyToStart)
        }

        fn all_execution_complete(&self) -> bool {
            self.aborted
        }

        fn finished_executing(&mut self, _: (), _: Option<Failure>) -> Result<(), Failure> {
            Ok(())
        }

        fn collect_failures(&mut self, sink: &mut Vec<Failure>) {
            sink.append(&mut self.failures);
        }

        fn cancel_execution(&mut self) {}

        fn abort_all_and_fail(&mut self, cause: Failure) {
            self.aborted = true;
            self.failures.push(cause);
        }

        fn health_diagnostics(&self) -> SourceDiagnostics {
            SourceDiagnostics::new("stuck source").queued_item("blocked (prerequisite never satisfied)")
        }
    }

    fn stuck_queue(coordinator: &Arc<StateCoordinator>) -> MergedQueue {
        let queue = MergedQueue::new(coordinator.clone(), false);
        coordinator.run_locked(|| {
            queue
                .add(Arc::new(PlanDetails::new(
                    StuckSource { aborted: false, failures: Vec::new() },
                    |_| Ok(()),
                )))
                .unwrap();
        });
        queue
    }

    #[test]
    fn healthy_when_nothing_is_queued() {
        let coordinator = Arc::new(StateCoordinator::new());
        let queue = MergedQueue::new(coordinator.clone(), false);
        let state = ExecutorState::new();

        coordinator.run_locked(|| {
            state.assert_healthy(&coordinator, &queue).unwrap();
        });
    }

    #[test]
    fn healthy_before_any_worker_joins() {
        let coordinator = Arc::new(StateCoordinator::new());
        let queue = stuck_queue(&coordinator);
        let state = ExecutorState::new();

        coordinator.run_locked(|| {
            state.assert_healthy(&coordinator, &queue).unwrap();
        });
    }

    #[test]
    fn healthy_while_a_worker_runs() {
        let coordinator = Arc::new(StateCoordinator::new());
        let queue = stuck_queue(&coordinator);
        let state = ExecutorState::new();
        let record = state.register_worker();
        assert_eq!(record.state(), WorkerState::Running);

        coordinator.run_locked(|| {
            state.assert_healthy(&coordinator, &queue).unwrap();
        });
    }

    #[test]
    fn aborts_when_all_workers_are_parked() {
        let coordinator = Arc::new(StateCoordinator::new());
        let queue = stuck_queue(&coordinator);
        let state = ExecutorState::new();
        state.register_worker().set_waiting();
        state.register_worker().set_stopped();

        let error = coordinator
            .run_locked(|| state.assert_healthy(&coordinator, &queue))
            .unwrap_err();
        let ExecutorError::NoProgress(message) = &error else {
            panic!("expected the liveness error, got {error:?}");
        };
        assert!(message.starts_with("Unable to make progress running work"));
        assert!(message.contains("stuck source"));
        assert!(message.contains("1 workers are waiting for work, 1 workers have stopped"));

        // The stuck plan was failed with the liveness error and can now be
        // collected.
        coordinator.run_locked(|| {
            assert!(queue.nothing_queued());
            queue.remove_finished_plans();
            queue.close().unwrap();
        });
    }
}
