use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

// -----------------------------------------------------------------------------
// Failure

/// A failure produced while running a plan: a node action's error, a caught
/// panic, a work-source error, or an abort cause.
///
/// Failures are shared because one cause can fail many unstarted nodes at once.
pub type Failure = Arc<dyn Error + Send + Sync + 'static>;

/// Wraps a concrete error into a [`Failure`].
#[inline]
pub fn failure(err: impl Error + Send + Sync + 'static) -> Failure {
    Arc::new(err)
}

// -----------------------------------------------------------------------------
// ExecutorError

/// Errors surfaced by the executor itself, as opposed to failures coming out
/// of node actions or work sources.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("parallelism must be at least 1")]
    InvalidParallelism,

    #[error("no further work can be submitted to this executor")]
    QueueClosed,

    #[error("cannot shut the executor down while plans are still running")]
    QueueNotDrained,

    #[error("work action panicked: {message}")]
    ActionPanicked { message: String },

    #[error("{0}")]
    NoProgress(String),
}

// -----------------------------------------------------------------------------
// Tests
