#![doc = include_str!("../README.md")]

// -----------------------------------------------------------------------------
// Modules

mod cancel;
mod coordination;
mod error;
mod executor;
mod health;
mod lease;
mod queue;
mod resource;
mod source;
mod stats;
mod worker;

// -----------------------------------------------------------------------------
// Top-Level Exports

pub use cancel::CancellationToken;
pub use coordination::{Disposition, StateCoordinator};
pub use error::{ExecutorError, Failure, failure};
pub use executor::{ExecutionResult, PlanExecutor, PlanExecutorBuilder};
pub use lease::{WorkerLease, WorkerLeaseRegistry};
pub use queue::NodeAction;
pub use resource::{ResourceLock, ResourceLockRegistry};
pub use source::{ExecutionState, Selection, SourceDiagnostics, WorkSource};
