use std::fmt;

use crate::error::Failure;

// -----------------------------------------------------------------------------
// ExecutionState / Selection

/// Answer to the stateless scheduling query: can this source give a worker
/// anything right now?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    /// At least one node may be ready; a worker should attempt a selection.
    MaybeWorkReadyToStart,
    /// Nodes remain, but none can start yet (unsatisfied dependencies or
    /// unavailable locks).
    NoWorkReadyToStart,
    /// Nothing further will ever be handed out. Nodes may still be running.
    NoMoreWorkToStart,
}

/// Result of asking a source for its next node.
#[derive(Debug)]
pub enum Selection<T> {
    /// A node, atomically moved out of the source's ready set.
    Item(T),
    /// Nodes remain, but none can start yet.
    NoWorkReadyToStart,
    /// Nothing further will ever be handed out.
    NoMoreWorkToStart,
}

impl<T> Selection<T> {
    /// Maps the selected node, if any.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Selection<U> {
        match self {
            Selection::Item(node) => Selection::Item(f(node)),
            Selection::NoWorkReadyToStart => Selection::NoWorkReadyToStart,
            Selection::NoMoreWorkToStart => Selection::NoMoreWorkToStart,
        }
    }
}

// -----------------------------------------------------------------------------
// WorkSource

/// The contract between the executor and one work plan.
///
/// Every method is invoked with the coordination state lock held, so
/// implementations must not block and must not call back into the executor.
/// The executor never reaches inside a source: dependency order, project
/// locks, and shared resource locks are the source's business, enforced when
/// it answers [`select_next`].
///
/// [`select_next`]: Self::select_next
pub trait WorkSource: Send {
    /// The unit of schedulable work this source hands out.
    type Node: Send + 'static;

    /// Human-readable name used in diagnostics.
    fn display_name(&self) -> String;

    /// Whether a worker should attempt a selection right now.
    fn execution_state(&mut self) -> ExecutionState;

    /// Hands out the next ready node, atomically moving it out of the ready
    /// set so no two workers can select the same node.
    ///
    /// An error is fatal for every plan sharing the executor: the caller
    /// aborts them all with the returned failure.
    fn select_next(&mut self) -> Result<Selection<Self::Node>, Failure>;

    /// Whether every node has finished, including nodes that were cancelled
    /// or failed without starting.
    fn all_execution_complete(&self) -> bool;

    /// Reports the outcome of one node handed out by [`select_next`]. A
    /// failure becomes part of the source's collected failures and may cascade
    /// cancellations inside the source.
    ///
    /// An error is fatal for every plan sharing the executor.
    ///
    /// [`select_next`]: Self::select_next
    fn finished_executing(
        &mut self,
        node: Self::Node,
        failure: Option<Failure>,
    ) -> Result<(), Failure>;

    /// Moves the failures collected so far into `sink`.
    fn collect_failures(&mut self, sink: &mut Vec<Failure>);

    /// Graceful stop: hand out no further nodes. Nodes already running
    /// complete normally.
    fn cancel_execution(&mut self);

    /// Hard stop: fail every unstarted node with `cause`.
    fn abort_all_and_fail(&mut self, cause: Failure);

    /// This source's contribution to the liveness diagnostic.
    fn health_diagnostics(&self) -> SourceDiagnostics;
}

// -----------------------------------------------------------------------------
// SourceDiagnostics

/// One source's view of its queued-but-unrunnable work, rendered into the
/// liveness failure message.
#[derive(Clone, Debug)]
pub struct SourceDiagnostics {
    display_name: String,
    queued: Vec<String>,
}

impl SourceDiagnostics {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            queued: Vec::new(),
        }
    }

    /// Adds one queued item to the report.
    pub fn queued_item(mut self, item: impl Into<String>) -> Self {
        self.queued.push(item.into());
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn queued(&self) -> &[String] {
        &self.queued
    }
}

impl fmt::Display for SourceDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "- {}", self.display_name)?;
        for item in &self.queued {
            writeln!(f, "    - {item}")?;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::{Selection, SourceDiagnostics};

    #[test]
    fn selection_map_preserves_the_empty_cases() {
        assert!(matches!(
            Selection::Item(2).map(|n| n * 2),
            Selection::Item(4)
        ));
        assert!(matches!(
            Selection::<u32>::NoWorkReadyToStart.map(|n| n),
            Selection::NoWorkReadyToStart
        ));
        assert!(matches!(
            Selection::<u32>::NoMoreWorkToStart.map(|n| n),
            Selection::NoMoreWorkToStart
        ));
    }

    #[test]
    fn diagnostics_render_as_a_tree() {
        let diagnostics = SourceDiagnostics::new("tasks for build ':'")
            .queued_item(":app:compile (dependencies not ready)")
            .queued_item(":app:test (dependencies not ready)");
        let rendered = diagnostics.to_string();
        assert_eq!(
            rendered,
            "- tasks for build ':'\n    \
             - :app:compile (dependencies not ready)\n    \
             - :app:test (dependencies not ready)\n"
        );
    }
}
