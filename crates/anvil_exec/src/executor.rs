use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anvil_utils::OnceFlag;

use crate::cancel::CancellationToken;
use crate::coordination::{Disposition, StateCoordinator};
use crate::error::{ExecutorError, Failure, failure};
use crate::health::ExecutorState;
use crate::lease::{WorkerLease, WorkerLeaseRegistry};
use crate::queue::{ErasedPlan, MergedQueue, PlanDetails};
use crate::resource::ResourceLockRegistry;
use crate::source::WorkSource;
use crate::stats::StatsCollector;
use crate::worker::ExecutorWorker;

// -----------------------------------------------------------------------------
// ExecutionResult

/// The failures collected while draining one plan: node failures, caught
/// panics, and abort causes, in the order the source reported them.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    failures: Vec<Failure>,
}

impl ExecutionResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    #[inline]
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    #[inline]
    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }
}

// -----------------------------------------------------------------------------
// PlanExecutorBuilder

/// Builder for creating a [`PlanExecutor`].
///
/// Currently configurable parameters:
///
/// - [`parallelism`]: Number of workers, including the thread that submits a
///   plan. Defaults to the number of logical cores on the system.
///
/// - [`thread_name`]: Thread name prefix. Pool threads are named in the format
///   `{thread_name} ({id})`, e.g., `Execution worker (1)`.
///
/// - [`cancellation_token`]: An externally owned [`CancellationToken`]; the
///   executor creates a private one when none is given.
///
/// [`parallelism`]: Self::parallelism
/// [`thread_name`]: Self::thread_name
/// [`cancellation_token`]: Self::cancellation_token
#[derive(Default)]
#[must_use]
pub struct PlanExecutorBuilder {
    parallelism: Option<usize>,
    thread_name: Option<String>,
    cancellation: Option<CancellationToken>,
}

impl PlanExecutorBuilder {
    #[inline]
    pub const fn new() -> Self {
        Self { parallelism: None, thread_name: None, cancellation: None }
    }

    /// Sets the worker count. Zero is rejected at [`build`](Self::build).
    #[inline]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Sets the pool thread name prefix.
    #[inline]
    pub fn thread_name(mut self, thread_name: String) -> Self {
        self.thread_name = Some(thread_name);
        self
    }

    /// Shares an externally owned cancellation token with the executor.
    #[inline]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Creates a [`PlanExecutor`] with the configured options.
    #[inline]
    pub fn build(self) -> Result<PlanExecutor, ExecutorError> {
        PlanExecutor::new_internal(self)
    }
}

// -----------------------------------------------------------------------------
// PlanExecutor

/// Drives submitted work plans to completion over a bounded worker pool.
///
/// [`process`] submits a plan and blocks until the plan's source reports every
/// node complete. The pool holds `parallelism - 1` threads; the submitting
/// thread is the final worker, draining a private queue that contains only its
/// own plan, so several plans can be in flight at once over one pool.
///
/// The coordination lock, the worker-lease registry, and the resource-lock
/// registry live for the executor's lifetime and are reachable through
/// accessors; work sources use the resource registry to honor the project and
/// shared-resource locks their nodes declare.
///
/// [`process`]: Self::process
pub struct PlanExecutor {
    parallelism: usize,
    thread_name: String,
    coordinator: Arc<StateCoordinator>,
    leases: Arc<WorkerLeaseRegistry>,
    resources: ResourceLockRegistry,
    cancellation: CancellationToken,
    queue: Arc<MergedQueue>,
    executor_state: Arc<ExecutorState>,
    stats: Arc<StatsCollector>,
    pool_started: OnceFlag,
    report_once: OnceFlag,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PlanExecutor {
    /// An executor with `parallelism` workers and default options.
    pub fn new(parallelism: usize) -> Result<Self, ExecutorError> {
        PlanExecutorBuilder::new().parallelism(parallelism).build()
    }

    fn new_internal(builder: PlanExecutorBuilder) -> Result<Self, ExecutorError> {
        let parallelism = match builder.parallelism {
            Some(0) => return Err(ExecutorError::InvalidParallelism),
            Some(parallelism) => parallelism,
            None => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };
        let coordinator = Arc::new(StateCoordinator::new());
        let cancellation = builder.cancellation.unwrap_or_default();
        {
            // A fully parked pool would never observe the flag on its own.
            let coordinator = coordinator.clone();
            cancellation.on_cancel(move || coordinator.notify_state_change());
        }
        Ok(Self {
            parallelism,
            thread_name: builder
                .thread_name
                .unwrap_or_else(|| String::from("Execution worker")),
            leases: Arc::new(WorkerLeaseRegistry::new(coordinator.clone(), parallelism)),
            resources: ResourceLockRegistry::new(coordinator.clone()),
            cancellation,
            queue: Arc::new(MergedQueue::new(coordinator.clone(), false)),
            executor_state: Arc::new(ExecutorState::new()),
            stats: Arc::new(StatsCollector::from_env()),
            pool_started: OnceFlag::new(),
            report_once: OnceFlag::new(),
            threads: Mutex::new(Vec::new()),
            coordinator,
        })
    }

    /// Number of workers, including the submitting thread.
    #[inline]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[inline]
    pub fn worker_lease_registry(&self) -> &WorkerLeaseRegistry {
        &self.leases
    }

    #[inline]
    pub fn resource_lock_registry(&self) -> &ResourceLockRegistry {
        &self.resources
    }

    /// Submits a plan and blocks until its source reports every node
    /// complete, running `action` for each node the source hands out.
    ///
    /// The calling thread joins the pool as a worker while it waits: it drains
    /// a private queue holding only this plan, reusing the worker lease it
    /// already owns when `process` is called from inside a node action.
    ///
    /// Fails with [`ExecutorError::QueueClosed`] after [`stop`](Self::stop);
    /// failures of the plan itself are returned in the [`ExecutionResult`].
    pub fn process<S>(
        &self,
        source: S,
        action: impl Fn(&mut S::Node) -> Result<(), Failure> + Send + Sync + 'static,
    ) -> Result<ExecutionResult, ExecutorError>
    where
        S: WorkSource + 'static,
    {
        let plan: Arc<dyn ErasedPlan> = Arc::new(PlanDetails::new(source, action));
        self.coordinator.run_locked(|| self.queue.add(plan.clone()))?;
        self.maybe_start_workers();

        // The submitting thread is blocked until the plan completes anyway, so
        // it works the plan itself instead of just parking.
        let (lease, created_here) = match self.leases.current_worker_lease() {
            Some(lease) => (lease, false),
            None => (self.leases.new_worker_lease(), true),
        };
        let private = Arc::new(MergedQueue::new(self.coordinator.clone(), true));
        self.coordinator.run_locked(|| private.add(plan.clone()))?;
        ExecutorWorker::new(
            private,
            self.queue.clone(),
            self.coordinator.clone(),
            self.leases.clone(),
            self.cancellation.clone(),
            self.executor_state.clone(),
        )
        .run(Some(lease.clone()), StatsCollector::worker_stats(&self.stats));

        let mut failures = Vec::new();
        self.await_completion(&plan, &lease, &mut failures);
        if created_here {
            // Give the slot back, but keep the lease registered: the thread
            // stays a worker for later submissions. An inherited lease is left
            // alone, since an enclosing node body still counts against the
            // worker bound.
            self.coordinator.run_locked(|| lease.unlock_if_held());
        }
        Ok(ExecutionResult { failures })
    }

    /// Parks until the plan's source reports complete, then collects its
    /// failures and garbage-collects the shared queue. The worker lease is
    /// given up while parked so another thread can use the slot.
    fn await_completion(
        &self,
        plan: &Arc<dyn ErasedPlan>,
        lease: &Rc<WorkerLease>,
        failures: &mut Vec<Failure>,
    ) {
        self.coordinator.with_state_lock(|| {
            if plan.all_execution_complete() {
                plan.collect_failures(failures);
                self.queue.remove_finished_plans();
                Disposition::Finished(())
            } else {
                lease.unlock_if_held();
                Disposition::Retry
            }
        });
    }

    /// Starts the `parallelism - 1` pool threads the first time a plan is
    /// submitted. Subsequent calls are no-ops.
    fn maybe_start_workers(&self) {
        if !self.pool_started.set() {
            return;
        }
        let worker_count = self.parallelism - 1;
        log::debug!("starting {worker_count} execution worker threads");
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        for i in 1..=worker_count {
            let queue = self.queue.clone();
            let coordinator = self.coordinator.clone();
            let leases = self.leases.clone();
            let cancellation = self.cancellation.clone();
            let executor_state = self.executor_state.clone();
            let stats = StatsCollector::worker_stats(&self.stats);
            let handle = thread::Builder::new()
                .name(format!("{} ({i})", self.thread_name))
                .spawn(move || {
                    ExecutorWorker::new(
                        queue.clone(),
                        queue,
                        coordinator,
                        leases,
                        cancellation,
                        executor_state,
                    )
                    .run(None, stats);
                })
                .expect("failed to spawn an execution worker thread");
            threads.push(handle);
        }
    }

    /// The liveness safety net, called from outside the executor between
    /// scheduling phases: when work is queued but every worker is parked or
    /// gone, the queued sources are failed with a diagnostic and the same
    /// error is returned.
    pub fn assert_healthy(&self) -> Result<(), ExecutorError> {
        self.coordinator
            .run_locked(|| self.executor_state.assert_healthy(&self.coordinator, &self.queue))
    }

    /// Shuts the executor down: closes the shared queue, joins the pool
    /// threads, and emits the stats report. Safe to call more than once;
    /// fails with [`ExecutorError::QueueNotDrained`] while plans are live.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        self.coordinator.run_locked(|| self.queue.close())?;
        let threads = {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *threads)
        };
        for handle in threads {
            handle.join().expect("an execution worker thread panicked");
        }
        if self.report_once.set() {
            self.stats.report();
        }
        Ok(())
    }
}

impl Drop for PlanExecutor {
    fn drop(&mut self) {
        if self.stop().is_ok() {
            return;
        }
        // Plans are still live at teardown (a source panicked out of a
        // `process` call, say). Fail their unstarted work so the pool threads
        // can drain and exit.
        self.coordinator.run_locked(|| {
            self.queue.abort_all_and_fail(failure(ExecutorError::QueueNotDrained));
            let _ = self.queue.close();
        });
        let _ = self.stop();
    }
}

// -----------------------------------------------------------------------------
// Tests
