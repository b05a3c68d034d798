//! Build sessions: configuration, cancellation, and results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::graph::{BuildGraph, GraphBuilder};
use crate::scheduler::{Scheduler, SkipReason, TaskOutcome, TaskReport};
use crate::slot::{Registry, SlotId};
use crate::store::{now_epoch_secs, ArtifactRecord, ArtifactStore};
use crate::task::{TaskId, TaskNode};

/// Options for one build session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on concurrently running actions. Zero is treated as one.
    pub max_parallelism: usize,
    /// Stop starting new tasks after the first failure.
    pub fail_fast: bool,
    /// Run every task regardless of recorded history.
    pub force_rebuild_all: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: std::thread::available_parallelism().map_or(1, |n| n.get()),
            fail_fast: false,
            force_rebuild_all: false,
        }
    }
}

/// Shared flag for cancelling a running session from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Artifacts provided from outside the graph, such as source directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supply {
    pub slot: SlotId,
    pub locations: Vec<PathBuf>,
}

impl Supply {
    pub fn new(slot: impl Into<SlotId>, locations: Vec<PathBuf>) -> Self {
        Self {
            slot: slot.into(),
            locations,
        }
    }
}

/// Per-outcome task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub executed: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

/// Everything a session reports back.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// One report per task, in dependency order.
    pub reports: Vec<TaskReport>,
    /// The generation this session wrote.
    pub generation: u64,
    pub duration: Duration,
    /// Set when the build state could not be persisted. Task outcomes are
    /// still valid, but the next session will not see this generation.
    pub store_error: Option<String>,
}

impl SessionResult {
    pub fn outcome(&self, task: &TaskId) -> Option<&TaskOutcome> {
        self.reports
            .iter()
            .find(|report| &report.task == task)
            .map(|report| &report.outcome)
    }

    /// True when every task executed or was up to date.
    pub fn is_success(&self) -> bool {
        self.reports.iter().all(|report| report.outcome.is_success())
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for report in &self.reports {
            match &report.outcome {
                TaskOutcome::Executed { .. } => summary.executed += 1,
                TaskOutcome::Skipped(SkipReason::UpToDate) => summary.up_to_date += 1,
                TaskOutcome::Skipped(SkipReason::Blocked { .. }) => summary.blocked += 1,
                TaskOutcome::Skipped(SkipReason::Cancelled) => summary.cancelled += 1,
                TaskOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    /// The first failed task in dependency order, as an error.
    pub fn first_failure(&self) -> Option<EngineError> {
        self.reports.iter().find_map(|report| match &report.outcome {
            TaskOutcome::Failed { error } => Some(EngineError::TaskExecutionFailure {
                task: report.task.clone(),
                message: error.clone(),
            }),
            _ => None,
        })
    }
}

/// Build a graph from `tasks` and run it.
///
/// # Errors
/// Returns an error if the graph is invalid, a supplied location is missing,
/// or the worker pool cannot start. Task failures are reported in the result.
pub fn run_build(
    registry: &Registry,
    tasks: Vec<TaskNode>,
    supplies: &[Supply],
    store: &ArtifactStore,
    config: &SessionConfig,
) -> Result<SessionResult, EngineError> {
    run_build_with_cancel(
        registry,
        tasks,
        supplies,
        store,
        config,
        &CancellationToken::new(),
    )
}

/// Like [`run_build`], with a token that can stop the session early.
///
/// # Errors
/// See [`run_build`].
pub fn run_build_with_cancel(
    registry: &Registry,
    tasks: Vec<TaskNode>,
    supplies: &[Supply],
    store: &ArtifactStore,
    config: &SessionConfig,
    cancel: &CancellationToken,
) -> Result<SessionResult, EngineError> {
    let builder = supplies
        .iter()
        .fold(GraphBuilder::new(registry), |builder, supply| {
            builder.supply(supply.slot.clone())
        });
    let graph = builder.build(tasks)?;
    run_graph(registry, &graph, supplies, store, config, cancel)
}

/// Run an already validated graph.
///
/// Supplies are recorded first, then tasks run, then the generation is
/// flushed. A flush failure is reported in [`SessionResult::store_error`].
///
/// # Errors
/// Returns an error if a supplied location is missing or the worker pool
/// cannot start.
pub fn run_graph(
    registry: &Registry,
    graph: &BuildGraph,
    supplies: &[Supply],
    store: &ArtifactStore,
    config: &SessionConfig,
    cancel: &CancellationToken,
) -> Result<SessionResult, EngineError> {
    let started = Instant::now();
    let generation = store.generation();
    tracing::info!(
        generation,
        tasks = graph.len(),
        max_parallelism = config.max_parallelism,
        fail_fast = config.fail_fast,
        force = config.force_rebuild_all,
        "starting build session"
    );

    for record in supply_records(supplies)? {
        let slot = registry.lookup(&record.slot)?;
        store.record(slot, record)?;
    }

    let reports = Scheduler::new(graph, registry, store, config).run(cancel)?;

    let mut carried = 0;
    for producer in unattempted_producers(graph, store, &reports) {
        carried += store.carry_forward(registry, &producer);
    }
    if carried > 0 {
        tracing::debug!(records = carried, "kept history of tasks that did not run");
    }

    let store_error = match store.flush() {
        Ok(()) => None,
        Err(err) => {
            tracing::warn!(error = %err, "could not persist build state");
            Some(err.to_string())
        }
    };

    let result = SessionResult {
        reports,
        generation,
        duration: started.elapsed(),
        store_error,
    };
    let summary = result.summary();
    tracing::info!(
        generation,
        executed = summary.executed,
        up_to_date = summary.up_to_date,
        failed = summary.failed,
        blocked = summary.blocked,
        cancelled = summary.cancelled,
        "build session finished"
    );
    Ok(result)
}

/// Producers with previous-generation records whose task was not attempted
/// this session: outside the graph, cancelled, or blocked by a failure.
fn unattempted_producers(
    graph: &BuildGraph,
    store: &ArtifactStore,
    reports: &[TaskReport],
) -> BTreeSet<TaskId> {
    let skipped: BTreeSet<&TaskId> = reports
        .iter()
        .filter(|report| {
            matches!(
                report.outcome,
                TaskOutcome::Skipped(SkipReason::Cancelled | SkipReason::Blocked { .. })
            )
        })
        .map(|report| &report.task)
        .collect();

    store
        .previous()
        .records
        .values()
        .flatten()
        .filter_map(|record| record.producer.as_ref())
        .filter(|producer| graph.index_of(producer).is_none() || skipped.contains(producer))
        .cloned()
        .collect()
}

/// One record per supplied slot, merging every supply for that slot.
pub(crate) fn supply_records(supplies: &[Supply]) -> Result<Vec<ArtifactRecord>, EngineError> {
    let mut merged: BTreeMap<&SlotId, Vec<PathBuf>> = BTreeMap::new();
    for supply in supplies {
        merged
            .entry(&supply.slot)
            .or_default()
            .extend(supply.locations.iter().cloned());
    }

    merged
        .into_iter()
        .map(|(slot, locations)| {
            let fingerprint = Fingerprint::of_locations(&locations)?;
            Ok(ArtifactRecord {
                slot: slot.clone(),
                locations,
                fingerprint,
                input_fingerprint: None,
                producer: None,
                created_at: now_epoch_secs(),
            })
        })
        .collect()
}
