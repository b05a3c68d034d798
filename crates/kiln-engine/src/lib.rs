#![forbid(unsafe_code)]
//! Artifact registry, task graph, incremental scheduler, and generation store.

pub mod command;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod init;
pub mod plan;
pub mod project;
pub mod scheduler;
pub mod session;
pub mod slot;
pub mod store;
pub mod task;

pub use command::CommandAction;
pub use error::EngineError;
pub use fingerprint::Fingerprint;
pub use graph::{BuildGraph, Edge, GraphBuilder};
pub use init::init_project;
pub use plan::{plan, PlanEntry, PlannedAction};
pub use project::{BuildOptions, Project, MANIFEST_FILE};
pub use scheduler::{ExecutionReason, Scheduler, SkipReason, TaskOutcome, TaskReport};
pub use session::{
    run_build, run_build_with_cancel, run_graph, CancellationToken, SessionConfig, SessionResult,
    Summary, Supply,
};
pub use slot::{
    ArtifactSlot, Cardinality, Category, Registry, SlotHandle, SlotId, SlotKind, WellKnownSlot,
};
pub use store::{ArtifactRecord, ArtifactStore, Generation};
pub use task::{
    ActionContext, ActionError, ActionOutput, FingerprintPolicy, TaskAction, TaskId, TaskNode,
};
