//! Incremental, parallel execution of a [`BuildGraph`].
//!
//! A coordinating thread tracks how many unfinished dependencies each task
//! has and hands ready tasks to a bounded rayon pool. Workers decide whether
//! their task is up to date, run it if not, and report the outcome back over
//! a channel. Only the coordinator touches scheduling state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::graph::BuildGraph;
use crate::session::{CancellationToken, SessionConfig};
use crate::slot::{Cardinality, Registry, SlotId};
use crate::store::{now_epoch_secs, ArtifactRecord, ArtifactStore};
use crate::task::{ActionContext, ActionError, ActionOutput, TaskId, TaskNode};

/// Why a task was executed rather than skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionReason {
    /// Incremental checks were disabled for the session.
    Forced,
    /// The task has no recorded outputs from a previous run.
    NoHistory,
    /// The input fingerprint differs from the recorded one.
    InputsChanged,
    /// A recorded output was modified or removed since it was produced.
    OutputsChanged,
}

impl fmt::Display for ExecutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Forced => "forced",
            Self::NoHistory => "no previous run",
            Self::InputsChanged => "inputs changed",
            Self::OutputsChanged => "outputs changed",
        };
        f.write_str(text)
    }
}

/// Why a task did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UpToDate,
    /// An upstream task failed.
    Blocked { failed: TaskId },
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up to date"),
            Self::Blocked { failed } => write!(f, "blocked by `{failed}`"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of one task in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Executed {
        reason: ExecutionReason,
        /// Input fingerprint recorded for this run.
        fingerprint: Fingerprint,
        duration: Duration,
    },
    Skipped(SkipReason),
    Failed { error: String },
}

impl TaskOutcome {
    /// Whether the task's outputs are valid for this generation.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Executed { .. } | Self::Skipped(SkipReason::UpToDate)
        )
    }

    /// The skip reason dependents inherit from this outcome, if any.
    fn passed_on(&self, task: &TaskId) -> Option<SkipReason> {
        match self {
            Self::Executed { .. } | Self::Skipped(SkipReason::UpToDate) => None,
            Self::Failed { .. } => Some(SkipReason::Blocked {
                failed: task.clone(),
            }),
            Self::Skipped(reason) => Some(reason.clone()),
        }
    }
}

/// A task's outcome, as listed in a session result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: TaskId,
    pub outcome: TaskOutcome,
}

/// Runs every task of a graph against a store.
#[derive(Debug)]
pub struct Scheduler<'a> {
    graph: &'a BuildGraph,
    registry: &'a Registry,
    store: &'a ArtifactStore,
    config: &'a SessionConfig,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a BuildGraph,
        registry: &'a Registry,
        store: &'a ArtifactStore,
        config: &'a SessionConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            store,
            config,
        }
    }

    /// Run the graph to completion and report every task in dependency order.
    ///
    /// At most `max_parallelism` actions run at once. A task starts only after
    /// all of its dependencies have finished. When a task fails, everything
    /// downstream of it is skipped as blocked; with `fail_fast`, no further
    /// task is started either. Tasks not yet started when `cancel` fires are
    /// skipped as cancelled.
    ///
    /// # Errors
    /// Returns [`EngineError::WorkerPool`] if the worker threads cannot be
    /// started. Task failures are reported in the outcomes, not as errors.
    pub fn run(&self, cancel: &CancellationToken) -> Result<Vec<TaskReport>, EngineError> {
        let workers = self.config.max_parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| EngineError::WorkerPool {
                message: e.to_string(),
            })?;

        let mut state = RunState::new(self.graph);
        let (sender, receiver) = mpsc::channel::<(usize, TaskOutcome)>();

        pool.in_place_scope(|scope| {
            let mut in_flight = 0usize;
            let mut halted = false;
            loop {
                while in_flight < workers {
                    let Some(index) = state.ready.pop_first() else {
                        break;
                    };
                    if let Some(reason) = state.inherited(index) {
                        state.complete(self.graph, index, TaskOutcome::Skipped(reason));
                        continue;
                    }
                    if halted || cancel.is_cancelled() {
                        state.complete(
                            self.graph,
                            index,
                            TaskOutcome::Skipped(SkipReason::Cancelled),
                        );
                        continue;
                    }

                    in_flight += 1;
                    let sender = sender.clone();
                    scope.spawn(move |_| {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(index, cancel)))
                                .unwrap_or_else(|_| TaskOutcome::Failed {
                                    error: "task action panicked".to_owned(),
                                });
                        // The coordinator outlives every worker.
                        let _ = sender.send((index, outcome));
                    });
                }

                if in_flight == 0 {
                    break;
                }
                let Ok((index, outcome)) = receiver.recv() else {
                    break;
                };
                in_flight = in_flight.saturating_sub(1);
                if self.config.fail_fast && matches!(outcome, TaskOutcome::Failed { .. }) {
                    halted = true;
                }
                state.complete(self.graph, index, outcome);
            }
        });

        Ok(state.into_reports(self.graph))
    }

    /// Decide whether the task at `index` is up to date and run it if not.
    fn evaluate(&self, index: usize, cancel: &CancellationToken) -> TaskOutcome {
        let Some(task) = self.graph.task(index) else {
            return TaskOutcome::Failed {
                error: format!("no task at index {index}"),
            };
        };

        let (records, inputs) = resolve_inputs(task, |slot| self.store.current_records(slot));
        let fingerprint = Fingerprint::for_task(task, &records);

        let reason = if self.config.force_rebuild_all {
            ExecutionReason::Forced
        } else {
            match check_history(self.store, task, &fingerprint) {
                Ok(reused) => {
                    for record in reused {
                        if let Err(err) = self.bind(record) {
                            return TaskOutcome::Failed {
                                error: err.to_string(),
                            };
                        }
                    }
                    tracing::debug!(task = %task.id(), "up to date");
                    return TaskOutcome::Skipped(SkipReason::UpToDate);
                }
                Err(reason) => reason,
            }
        };

        if cancel.is_cancelled() {
            return TaskOutcome::Skipped(SkipReason::Cancelled);
        }

        tracing::debug!(task = %task.id(), %reason, "executing");
        let started = Instant::now();
        let ctx = ActionContext::new(task.id(), &inputs, task.outputs(), cancel);
        let result = task
            .action()
            .execute(&ctx)
            .and_then(|output| self.publish(task, &output, &fingerprint));
        match result {
            Ok(()) => TaskOutcome::Executed {
                reason,
                fingerprint,
                duration: started.elapsed(),
            },
            Err(_) if cancel.is_cancelled() => TaskOutcome::Skipped(SkipReason::Cancelled),
            Err(err) => TaskOutcome::Failed {
                error: err.to_string(),
            },
        }
    }

    /// Validate an action's reported outputs and bind them to their slots.
    ///
    /// Nothing is bound unless every declared output checks out.
    fn publish(
        &self,
        task: &TaskNode,
        output: &ActionOutput,
        input_fingerprint: &Fingerprint,
    ) -> Result<(), ActionError> {
        if let Some(extra) = output.slots().find(|s| !task.outputs().contains(s)) {
            return Err(ActionError::new(format!(
                "reported undeclared output slot `{extra}`"
            )));
        }

        let mut records = Vec::with_capacity(task.outputs().len());
        for slot_id in task.outputs() {
            let locations = output.get(slot_id).ok_or_else(|| {
                ActionError::new(format!("did not report output slot `{slot_id}`"))
            })?;
            let slot = self
                .registry
                .lookup(slot_id)
                .map_err(|e| ActionError::new(e.to_string()))?;
            if slot.cardinality() == Cardinality::Single && locations.len() != 1 {
                return Err(ActionError::new(format!(
                    "slot `{slot_id}` holds one artifact but {} locations were reported",
                    locations.len()
                )));
            }
            let fingerprint = Fingerprint::of_locations(locations)
                .map_err(|e| ActionError::new(format!("output `{slot_id}`: {e}")))?;
            records.push(ArtifactRecord {
                slot: slot_id.clone(),
                locations: locations.to_vec(),
                fingerprint,
                input_fingerprint: Some(input_fingerprint.clone()),
                producer: Some(task.id().clone()),
                created_at: now_epoch_secs(),
            });
        }

        for record in records {
            self.bind(record)
                .map_err(|e| ActionError::new(e.to_string()))?;
        }
        Ok(())
    }

    fn bind(&self, record: ArtifactRecord) -> Result<(), EngineError> {
        let slot = self.registry.lookup(&record.slot)?;
        self.store.record(slot, record)
    }
}

/// Scheduling state owned by the coordinating thread.
struct RunState {
    remaining: Vec<usize>,
    inherited: Vec<Option<SkipReason>>,
    outcomes: Vec<Option<TaskOutcome>>,
    ready: BTreeSet<usize>,
}

impl RunState {
    fn new(graph: &BuildGraph) -> Self {
        let remaining: Vec<usize> = (0..graph.len())
            .map(|i| graph.dependencies(i).count())
            .collect();
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(i, _)| i)
            .collect();
        Self {
            remaining,
            inherited: vec![None; graph.len()],
            outcomes: vec![None; graph.len()],
            ready,
        }
    }

    fn inherited(&self, index: usize) -> Option<SkipReason> {
        self.inherited.get(index).cloned().flatten()
    }

    /// Record `outcome` and release dependents whose dependencies are now all done.
    fn complete(&mut self, graph: &BuildGraph, index: usize, outcome: TaskOutcome) {
        let Some(task) = graph.task(index) else {
            return;
        };
        log_outcome(task.id(), &outcome);

        let passed_on = outcome.passed_on(task.id());
        if let Some(slot) = self.outcomes.get_mut(index) {
            *slot = Some(outcome);
        }

        for dependent in graph.dependents(index) {
            if let Some(reason) = &passed_on {
                if let Some(inherited) = self.inherited.get_mut(dependent) {
                    if inherited.is_none() {
                        *inherited = Some(reason.clone());
                    }
                }
            }
            if let Some(count) = self.remaining.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.insert(dependent);
                }
            }
        }
    }

    fn into_reports(mut self, graph: &BuildGraph) -> Vec<TaskReport> {
        graph
            .topological_order()
            .into_iter()
            .filter_map(|index| {
                let task = graph.task(index)?.id().clone();
                let outcome = self
                    .outcomes
                    .get_mut(index)
                    .and_then(Option::take)
                    .unwrap_or(TaskOutcome::Skipped(SkipReason::Cancelled));
                Some(TaskReport { task, outcome })
            })
            .collect()
    }
}

fn log_outcome(task: &TaskId, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Executed {
            reason, duration, ..
        } => {
            tracing::info!(task = %task, %reason, elapsed = ?duration, "task executed");
        }
        TaskOutcome::Skipped(reason) => {
            tracing::info!(task = %task, %reason, "task skipped");
        }
        TaskOutcome::Failed { error } => {
            tracing::warn!(task = %task, %error, "task failed");
        }
    }
}

/// Collect the records bound to a task's inputs and their locations.
pub(crate) fn resolve_inputs(
    task: &TaskNode,
    records_for: impl Fn(&SlotId) -> Vec<ArtifactRecord>,
) -> (Vec<ArtifactRecord>, BTreeMap<SlotId, Vec<PathBuf>>) {
    let mut records = Vec::new();
    let mut locations = BTreeMap::new();
    for slot in task.inputs() {
        let bound = records_for(slot);
        let paths: Vec<PathBuf> = bound
            .iter()
            .flat_map(|record| record.locations.iter().cloned())
            .collect();
        locations.insert(slot.clone(), paths);
        records.extend(bound);
    }
    (records, locations)
}

/// Check a task's previous-generation records against `fingerprint`.
///
/// Returns the records to reuse when the task is up to date, otherwise the
/// reason it has to run. A task with no outputs always runs.
pub(crate) fn check_history(
    store: &ArtifactStore,
    task: &TaskNode,
    fingerprint: &Fingerprint,
) -> Result<Vec<ArtifactRecord>, ExecutionReason> {
    if task.outputs().is_empty() {
        return Err(ExecutionReason::NoHistory);
    }

    let mut previous = Vec::new();
    for slot in task.outputs() {
        let records = store.previous_records(slot, Some(task.id()));
        if records.is_empty() {
            return Err(ExecutionReason::NoHistory);
        }
        previous.extend(records);
    }

    if previous
        .iter()
        .any(|record| record.input_fingerprint.as_ref() != Some(fingerprint))
    {
        return Err(ExecutionReason::InputsChanged);
    }

    let outputs_intact = previous.iter().all(|record| {
        Fingerprint::of_locations(&record.locations)
            .is_ok_and(|current| current == record.fingerprint)
    });
    if !outputs_intact {
        return Err(ExecutionReason::OutputsChanged);
    }

    Ok(previous)
}
