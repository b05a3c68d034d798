//! Task nodes and the action interface the scheduler invokes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::session::CancellationToken;
use crate::slot::SlotId;

/// Identifier of a task, unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What an action sees while it runs.
pub struct ActionContext<'a> {
    task: &'a TaskId,
    inputs: &'a BTreeMap<SlotId, Vec<PathBuf>>,
    outputs: &'a [SlotId],
    cancel: &'a CancellationToken,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        task: &'a TaskId,
        inputs: &'a BTreeMap<SlotId, Vec<PathBuf>>,
        outputs: &'a [SlotId],
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            task,
            inputs,
            outputs,
            cancel,
        }
    }

    pub fn task(&self) -> &TaskId {
        self.task
    }

    /// Resolved locations for every input slot.
    pub fn inputs(&self) -> &BTreeMap<SlotId, Vec<PathBuf>> {
        self.inputs
    }

    /// Resolved locations of one input slot, empty if it is not an input.
    pub fn input(&self, slot: &SlotId) -> &[PathBuf] {
        self.inputs.get(slot).map_or(&[], Vec::as_slice)
    }

    /// The output slots the action must report.
    pub fn outputs(&self) -> &[SlotId] {
        self.outputs
    }

    /// Long-running actions should poll this and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Locations an action produced, keyed by output slot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    outputs: BTreeMap<SlotId, Vec<PathBuf>>,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ActionOutput::insert`].
    #[must_use]
    pub fn with(mut self, slot: impl Into<SlotId>, locations: Vec<PathBuf>) -> Self {
        self.insert(slot, locations);
        self
    }

    pub fn insert(&mut self, slot: impl Into<SlotId>, locations: Vec<PathBuf>) {
        self.outputs.insert(slot.into(), locations);
    }

    pub fn get(&self, slot: &SlotId) -> Option<&[PathBuf]> {
        self.outputs.get(slot).map(Vec::as_slice)
    }

    pub fn slots(&self) -> impl Iterator<Item = &SlotId> {
        self.outputs.keys()
    }
}

/// An action failed. The message ends up in the task's outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ActionError {
    message: String,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<kiln_util::error::UtilError> for ActionError {
    fn from(err: kiln_util::error::UtilError) -> Self {
        Self::new(err.to_string())
    }
}

/// The work a task performs.
///
/// Actions run on worker threads and may run concurrently with each other.
/// Any closure with the right signature is an action.
pub trait TaskAction: Send + Sync {
    /// Run the action against resolved inputs.
    ///
    /// # Errors
    /// Returns an error when the work fails; the task is then reported as failed.
    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError>;
}

impl<F> TaskAction for F
where
    F: Fn(&ActionContext<'_>) -> Result<ActionOutput, ActionError> + Send + Sync,
{
    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        self(ctx)
    }
}

/// Which input slots contribute to a task's input fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FingerprintPolicy {
    #[default]
    AllInputs,
    /// Only these slots count; changes to other inputs never trigger a rerun.
    Only(BTreeSet<SlotId>),
}

impl FingerprintPolicy {
    pub fn includes(&self, slot: &SlotId) -> bool {
        match self {
            Self::AllInputs => true,
            Self::Only(slots) => slots.contains(slot),
        }
    }
}

/// A unit of work that consumes input slots and produces output slots.
#[derive(Clone)]
pub struct TaskNode {
    id: TaskId,
    inputs: Vec<SlotId>,
    outputs: Vec<SlotId>,
    action: Arc<dyn TaskAction>,
    config_fingerprint: String,
    policy: FingerprintPolicy,
}

impl TaskNode {
    pub fn new(id: impl Into<TaskId>, action: impl TaskAction + 'static) -> Self {
        Self::from_shared(id, Arc::new(action))
    }

    pub fn from_shared(id: impl Into<TaskId>, action: Arc<dyn TaskAction>) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            action,
            config_fingerprint: kiln_util::hash::sha256_bytes(b""),
            policy: FingerprintPolicy::AllInputs,
        }
    }

    #[must_use]
    pub fn input(mut self, slot: impl Into<SlotId>) -> Self {
        let slot = slot.into();
        if !self.inputs.contains(&slot) {
            self.inputs.push(slot);
        }
        self
    }

    #[must_use]
    pub fn output(mut self, slot: impl Into<SlotId>) -> Self {
        let slot = slot.into();
        if !self.outputs.contains(&slot) {
            self.outputs.push(slot);
        }
        self
    }

    /// Set the configuration text; its digest becomes part of the input
    /// fingerprint.
    #[must_use]
    pub fn config(mut self, config: &str) -> Self {
        self.config_fingerprint = kiln_util::hash::sha256_bytes(config.as_bytes());
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: FingerprintPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn inputs(&self) -> &[SlotId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SlotId] {
        &self.outputs
    }

    pub fn action(&self) -> &dyn TaskAction {
        self.action.as_ref()
    }

    pub fn config_fingerprint(&self) -> &str {
        &self.config_fingerprint
    }

    pub fn fingerprint_policy(&self) -> &FingerprintPolicy {
        &self.policy
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("config_fingerprint", &self.config_fingerprint)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
