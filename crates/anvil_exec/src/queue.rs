use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::coordination::StateCoordinator;
use crate::error::{ExecutorError, Failure};
use crate::source::{ExecutionState, Selection, SourceDiagnostics, WorkSource};

// -----------------------------------------------------------------------------
// Node actions

/// The callable run for every node a source hands out. The executor invokes
/// it outside the state lock; panics are caught and reported as failures.
pub type NodeAction<N> = dyn Fn(&mut N) -> Result<(), Failure> + Send + Sync;

// -----------------------------------------------------------------------------
// Plan details

/// One submitted plan: a work source paired with the action to run for each of
/// its nodes. Lives from submission until the source reports every node
/// complete and a queue scan garbage-collects it.
pub(crate) struct PlanDetails<S: WorkSource> {
    /// Only locked while the state lock is held, so never contended.
    source: Mutex<S>,
    action: Arc<NodeAction<S::Node>>,
}

impl<S: WorkSource> PlanDetails<S> {
    pub(crate) fn new(
        source: S,
        action: impl Fn(&mut S::Node) -> Result<(), Failure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            action: Arc::new(action),
        }
    }
}

/// Object-safe view of a [`PlanDetails`] with the node type erased, so plans
/// over different node types share one queue and one pool.
pub(crate) trait ErasedPlan: Send + Sync {
    fn display_name(&self) -> String;
    fn execution_state(&self) -> ExecutionState;
    fn select_next(&self) -> Result<Selection<Box<dyn Any + Send>>, Failure>;
    fn all_execution_complete(&self) -> bool;
    /// Runs the submitted action for `node`. Called outside the state lock.
    fn run_action(&self, node: &mut (dyn Any + Send)) -> Result<(), Failure>;
    fn finished_executing(
        &self,
        node: Box<dyn Any + Send>,
        failure: Option<Failure>,
    ) -> Result<(), Failure>;
    fn collect_failures(&self, sink: &mut Vec<Failure>);
    fn cancel_execution(&self);
    fn abort_all_and_fail(&self, cause: Failure);
    fn health_diagnostics(&self) -> SourceDiagnostics;
}

impl<S: WorkSource + 'static> PlanDetails<S> {
    fn source(&self) -> MutexGuard<'_, S> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: WorkSource + 'static> ErasedPlan for PlanDetails<S> {
    fn display_name(&self) -> String {
        self.source().display_name()
    }

    fn execution_state(&self) -> ExecutionState {
        self.source().execution_state()
    }

    fn select_next(&self) -> Result<Selection<Box<dyn Any + Send>>, Failure> {
        let selection = self.source().select_next()?;
        Ok(selection.map(|node| Box::new(node) as Box<dyn Any + Send>))
    }

    fn all_execution_complete(&self) -> bool {
        self.source().all_execution_complete()
    }

    fn run_action(&self, node: &mut (dyn Any + Send)) -> Result<(), Failure> {
        let Some(node) = node.downcast_mut::<S::Node>() else {
            unreachable!("a work item is only ever returned to the plan that selected it");
        };
        (self.action)(node)
    }

    fn finished_executing(
        &self,
        node: Box<dyn Any + Send>,
        failure: Option<Failure>,
    ) -> Result<(), Failure> {
        let Ok(node) = node.downcast::<S::Node>() else {
            unreachable!("a work item is only ever returned to the plan that selected it");
        };
        self.source().finished_executing(*node, failure)
    }

    fn collect_failures(&self, sink: &mut Vec<Failure>) {
        self.source().collect_failures(sink);
    }

    fn cancel_execution(&self) {
        self.source().cancel_execution();
    }

    fn abort_all_and_fail(&self, cause: Failure) {
        self.source().abort_all_and_fail(cause);
    }

    fn health_diagnostics(&self) -> SourceDiagnostics {
        self.source().health_diagnostics()
    }
}

// -----------------------------------------------------------------------------
// WorkItem

/// A selected node travelling from selection to completion. Lives only while
/// a worker runs it.
pub(crate) struct WorkItem {
    pub(crate) node: Box<dyn Any + Send>,
    pub(crate) plan: Arc<dyn ErasedPlan>,
}

// -----------------------------------------------------------------------------
// MergedQueue

/// The ordered collection of live plans that workers draw from.
///
/// Newly submitted plans are prepended, on the assumption that the submitting
/// thread's running work depends on them; scans visit plans head-first, so the
/// newest plan wins each scan. Across scans there is no stronger fairness
/// guarantee.
pub(crate) struct MergedQueue {
    coordinator: Arc<StateCoordinator>,
    /// Report `NoMoreWorkToStart` as soon as the queue drains, instead of
    /// waiting for [`close`](Self::close). Set on the private queue a
    /// submitting thread works so its worker exits with its plan.
    auto_finish: bool,
    /// Only locked under the state lock.
    state: Mutex<QueueState>,
}

struct QueueState {
    plans: Vec<Arc<dyn ErasedPlan>>,
    finished: bool,
}

impl MergedQueue {
    pub(crate) fn new(coordinator: Arc<StateCoordinator>, auto_finish: bool) -> Self {
        Self {
            coordinator,
            auto_finish,
            state: Mutex::new(QueueState { plans: Vec::new(), finished: false }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.coordinator.assert_state_lock_held();
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepends a plan. Fails once the queue has been closed.
    pub(crate) fn add(&self, plan: Arc<dyn ErasedPlan>) -> Result<(), ExecutorError> {
        let mut state = self.lock_state();
        if state.finished {
            return Err(ExecutorError::QueueClosed);
        }
        state.plans.insert(0, plan);
        drop(state);
        self.coordinator.notify_state_change();
        Ok(())
    }

    /// Scans the live plans in order; the first plan that may have ready work
    /// answers for the whole queue. Plans that have completed everything are
    /// removed as the scan passes them.
    pub(crate) fn execution_state(&self) -> ExecutionState {
        let mut state = self.lock_state();
        let mut index = 0;
        while index < state.plans.len() {
            let plan = state.plans[index].clone();
            match plan.execution_state() {
                ExecutionState::MaybeWorkReadyToStart => {
                    return ExecutionState::MaybeWorkReadyToStart;
                }
                ExecutionState::NoMoreWorkToStart if plan.all_execution_complete() => {
                    state.plans.remove(index);
                }
                ExecutionState::NoMoreWorkToStart | ExecutionState::NoWorkReadyToStart => {
                    index += 1;
                }
            }
        }
        if state.finished || (self.auto_finish && state.plans.is_empty()) {
            ExecutionState::NoMoreWorkToStart
        } else {
            ExecutionState::NoWorkReadyToStart
        }
    }

    /// Like [`execution_state`](Self::execution_state), but asks each plan for
    /// an actual node; the first non-empty selection wins.
    pub(crate) fn select_next(&self) -> Result<Selection<WorkItem>, Failure> {
        let mut state = self.lock_state();
        let mut index = 0;
        while index < state.plans.len() {
            let plan = state.plans[index].clone();
            match plan.select_next()? {
                Selection::Item(node) => {
                    return Ok(Selection::Item(WorkItem { node, plan }));
                }
                Selection::NoMoreWorkToStart => {
                    if plan.all_execution_complete() {
                        state.plans.remove(index);
                    } else {
                        index += 1;
                    }
                }
                Selection::NoWorkReadyToStart => {
                    index += 1;
                }
            }
        }
        if state.finished || (self.auto_finish && state.plans.is_empty()) {
            Ok(Selection::NoMoreWorkToStart)
        } else {
            Ok(Selection::NoWorkReadyToStart)
        }
    }

    /// Whether every live plan reports `NoMoreWorkToStart`. Plans whose nodes
    /// are still running count, as long as nothing further is queued.
    pub(crate) fn nothing_queued(&self) -> bool {
        let state = self.lock_state();
        state
            .plans
            .iter()
            .all(|plan| plan.execution_state() == ExecutionState::NoMoreWorkToStart)
    }

    /// Garbage-collects plans that have completed everything.
    pub(crate) fn remove_finished_plans(&self) {
        let mut state = self.lock_state();
        state.plans.retain(|plan| {
            !(plan.execution_state() == ExecutionState::NoMoreWorkToStart
                && plan.all_execution_complete())
        });
    }

    /// Forwards a graceful stop to every live source.
    pub(crate) fn cancel_execution(&self) {
        let state = self.lock_state();
        for plan in &state.plans {
            plan.cancel_execution();
        }
    }

    /// Fails every unstarted node of every live source with `cause`.
    pub(crate) fn abort_all_and_fail(&self, cause: Failure) {
        let state = self.lock_state();
        for plan in &state.plans {
            plan.abort_all_and_fail(cause.clone());
        }
        drop(state);
        self.coordinator.notify_state_change();
    }

    /// Each live source's contribution to the liveness diagnostic.
    pub(crate) fn health_diagnostics(&self) -> Vec<SourceDiagnostics> {
        let state = self.lock_state();
        state.plans.iter().map(|plan| plan.health_diagnostics()).collect()
    }

    /// Marks the queue finished so idle workers exit. Closing an already
    /// closed queue is a no-op; closing over live plans is an error.
    pub(crate) fn close(&self) -> Result<(), ExecutorError> {
        let mut state = self.lock_state();
        if state.finished {
            return Ok(());
        }
        state.plans.retain(|plan| {
            !(plan.execution_state() == ExecutionState::NoMoreWorkToStart
                && plan.all_execution_complete())
        });
        if !state.plans.is_empty() {
            return Err(ExecutorError::QueueNotDrained);
        }
        state.finished = true;
        drop(state);
        self.coordinator.notify_state_change();
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests
