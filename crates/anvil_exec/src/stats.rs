//! Opt-in executor timing stats.
//!
//! Off by default: the disabled path never reads the clock and never
//! allocates, so the hot scheduling loop pays nothing for the feature.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

// -----------------------------------------------------------------------------
// Collector

/// Environment variable enabling the collecting implementation.
pub(crate) const STATS_ENV_VAR: &str = "ANVIL_EXECUTOR_STATS";

/// Aggregated timings across completed workers, reported once on `stop()`.
pub(crate) enum StatsCollector {
    Disabled,
    Enabled(Mutex<Aggregate>),
}

#[derive(Default)]
pub(crate) struct Aggregate {
    workers: u32,
    items: u64,
    select: Duration,
    execute: Duration,
    mark_finished: Duration,
}

impl StatsCollector {
    pub(crate) fn from_env() -> Self {
        match std::env::var(STATS_ENV_VAR) {
            Ok(value) if value == "1" || value.eq_ignore_ascii_case("true") => {
                Self::Enabled(Mutex::new(Aggregate::default()))
            }
            _ => Self::Disabled,
        }
    }

    /// The per-worker side of this collector.
    pub(crate) fn worker_stats(this: &Arc<Self>) -> WorkerStats {
        match **this {
            Self::Disabled => WorkerStats::Noop,
            Self::Enabled(_) => WorkerStats::Collecting(Box::new(CollectingWorkerStats {
                collector: this.clone(),
                items: 0,
                select: Duration::ZERO,
                execute: Duration::ZERO,
                mark_finished: Duration::ZERO,
                select_started: None,
            })),
        }
    }

    fn record(&self, worker: &CollectingWorkerStats) {
        if let Self::Enabled(aggregate) = self {
            let mut aggregate = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
            aggregate.workers += 1;
            aggregate.items += worker.items;
            aggregate.select += worker.select;
            aggregate.execute += worker.execute;
            aggregate.mark_finished += worker.mark_finished;
        }
    }

    /// Logs the averages across completed workers.
    pub(crate) fn report(&self) {
        let Self::Enabled(aggregate) = self else {
            return;
        };
        let aggregate = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
        if aggregate.workers == 0 {
            log::info!("executor stats: no workers completed");
            return;
        }
        let workers = aggregate.workers;
        log::info!(
            "executor stats: {workers} workers ran {} items; per worker avg: select {:?}, execute {:?}, mark finished {:?}",
            aggregate.items,
            aggregate.select / workers,
            aggregate.execute / workers,
            aggregate.mark_finished / workers,
        );
    }
}

// -----------------------------------------------------------------------------
// Per-worker side

/// Timing accumulator owned by one worker. The no-op variant is a unit value.
pub(crate) enum WorkerStats {
    Noop,
    Collecting(Box<CollectingWorkerStats>),
}

pub(crate) struct CollectingWorkerStats {
    collector: Arc<StatsCollector>,
    items: u64,
    select: Duration,
    execute: Duration,
    mark_finished: Duration,
    select_started: Option<Instant>,
}

impl WorkerStats {
    /// Reads the clock only when collection is enabled.
    #[inline]
    pub(crate) fn clock(&self) -> Option<Instant> {
        match self {
            Self::Noop => None,
            Self::Collecting(_) => Some(Instant::now()),
        }
    }

    /// Marks the start of one selection, including any time parked waiting
    /// for ready work.
    pub(crate) fn select_started(&mut self) {
        if let Self::Collecting(stats) = self {
            stats.select_started = Some(Instant::now());
        }
    }

    pub(crate) fn select_finished(&mut self) {
        if let Self::Collecting(stats) = self
            && let Some(started) = stats.select_started.take()
        {
            stats.select += started.elapsed();
        }
    }

    pub(crate) fn add_execute(&mut self, started: Option<Instant>) {
        if let Self::Collecting(stats) = self
            && let Some(started) = started
        {
            stats.execute += started.elapsed();
            stats.items += 1;
        }
    }

    pub(crate) fn add_mark_finished(&mut self, started: Option<Instant>) {
        if let Self::Collecting(stats) = self
            && let Some(started) = started
        {
            stats.mark_finished += started.elapsed();
        }
    }

    /// Folds this worker's totals into the collector.
    pub(crate) fn worker_finished(self) {
        if let Self::Collecting(stats) = self {
            stats.collector.record(&stats);
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
