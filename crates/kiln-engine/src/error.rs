//! Error types for kiln-engine.

use crate::slot::SlotId;
use crate::task::TaskId;

/// Errors produced by engine operations.
///
/// Graph construction errors are raised before any task runs. Task failures
/// are normally reported per task in a `SessionResult`; the
/// `TaskExecutionFailure` variant exists so callers can turn one into an error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),

    /// The project manifest could not be read or is invalid.
    #[error("{0}")]
    Manifest(#[from] kiln_config::ManifestError),

    #[error("slot `{id}` is already declared")]
    DuplicateSlot { id: SlotId },

    #[error("slot `{id}` is not declared")]
    UnknownSlot { id: SlotId },

    #[error("slot `{id}` is invalid: {reason}")]
    InvalidSlot { id: SlotId, reason: String },

    #[error("task `{id}` is declared more than once")]
    DuplicateTask { id: TaskId },

    #[error("task `{id}` does not exist")]
    UnknownTask { id: TaskId },

    #[error("slot `{slot}` is both an input and an output of task `{task}`")]
    SlotBothInputAndOutput { task: TaskId, slot: SlotId },

    /// A non-appendable slot has more than one producer.
    #[error("slot `{slot}` is produced by both `{first}` and `{second}` but is not appendable")]
    ConflictingProducer {
        slot: SlotId,
        first: String,
        second: String,
    },

    #[error("task `{task}` consumes `{slot}`, which no task produces and no source supplies")]
    DanglingInput { task: TaskId, slot: SlotId },

    /// The listed tasks form a cycle; the first id is repeated at the end.
    #[error("task cycle detected: {}", join_ids(cycle))]
    CycleDetected { cycle: Vec<TaskId> },

    #[error("task `{task}` failed: {message}")]
    TaskExecutionFailure { task: TaskId, message: String },

    /// The persisted build state could not be read or written.
    #[error("cannot access build state at {path}: {message}")]
    StoreIoFailure { path: String, message: String },

    /// The persisted build state is not valid JSON of the expected shape.
    #[error("corrupt build state at {path}: {source}")]
    StoreFormat {
        path: String,
        source: serde_json::Error,
    },

    #[error("cannot start worker pool: {message}")]
    WorkerPool { message: String },

    /// A project already exists at the target path.
    #[error("kiln.toml already exists at {path}; refusing to overwrite it")]
    ProjectExists { path: String },
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = EngineError::CycleDetected {
            cycle: vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("a")],
        };
        assert_eq!(err.to_string(), "task cycle detected: a -> b -> a");
    }

    #[test]
    fn conflicting_producer_names_both() {
        let err = EngineError::ConflictingProducer {
            slot: SlotId::new("apk"),
            first: "package-debug".to_owned(),
            second: "package-release".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("package-debug"), "message was: {msg}");
        assert!(msg.contains("package-release"), "message was: {msg}");
    }
}
