//! Dry runs: predict which tasks a session would execute.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::graph::BuildGraph;
use crate::scheduler::{check_history, resolve_inputs, ExecutionReason};
use crate::session::{supply_records, SessionConfig, Supply};
use crate::store::{ArtifactStore, Generation};
use crate::task::TaskId;

/// What a session would do with one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    UpToDate,
    Execute(ExecutionReason),
    /// An upstream task would execute, so this one's inputs are not known yet.
    AfterUpstream,
}

impl PlannedAction {
    pub fn would_execute(self) -> bool {
        !matches!(self, Self::UpToDate)
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up to date"),
            Self::Execute(reason) => write!(f, "run ({reason})"),
            Self::AfterUpstream => f.write_str("run (upstream changed)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub task: TaskId,
    pub action: PlannedAction,
}

/// Predict the outcome of running `graph` against `store` without running
/// any action or writing any state.
///
/// A task downstream of one that would execute is reported as
/// [`PlannedAction::AfterUpstream`]; the real session may still find it up
/// to date if the upstream output turns out unchanged.
///
/// # Errors
/// Returns an error if a supplied location is missing.
pub fn plan(
    graph: &BuildGraph,
    supplies: &[Supply],
    store: &ArtifactStore,
    config: &SessionConfig,
) -> Result<Vec<PlanEntry>, EngineError> {
    let mut simulated = Generation::default();
    for record in supply_records(supplies)? {
        simulated
            .records
            .entry(record.slot.clone())
            .or_default()
            .push(record);
    }

    let mut after_upstream = BTreeSet::new();
    let mut entries = Vec::with_capacity(graph.len());
    for index in graph.topological_order() {
        let Some(task) = graph.task(index) else {
            continue;
        };

        let action = if after_upstream.contains(&index) {
            PlannedAction::AfterUpstream
        } else if config.force_rebuild_all {
            PlannedAction::Execute(ExecutionReason::Forced)
        } else {
            let (records, _) = resolve_inputs(task, |slot| simulated.records_in(slot));
            let fingerprint = Fingerprint::for_task(task, &records);
            match check_history(store, task, &fingerprint) {
                Ok(reused) => {
                    for record in reused {
                        simulated
                            .records
                            .entry(record.slot.clone())
                            .or_default()
                            .push(record);
                    }
                    PlannedAction::UpToDate
                }
                Err(reason) => PlannedAction::Execute(reason),
            }
        };

        if action.would_execute() {
            after_upstream.extend(graph.transitive_dependents(index));
        }
        entries.push(PlanEntry {
            task: task.id().clone(),
            action,
        });
    }
    Ok(entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::graph::GraphBuilder;
    use crate::session::run_build;
    use crate::slot::{ArtifactSlot, Category, Registry, SlotKind};
    use crate::task::{ActionContext, ActionError, ActionOutput, TaskNode};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        for id in ["src", "x", "y", "z"] {
            let kind = if id == "src" {
                SlotKind::Directory
            } else {
                SlotKind::File
            };
            registry
                .declare(ArtifactSlot::single(id, kind, Category::Intermediates))
                .unwrap();
        }
        registry
    }

    fn writer(dir: &std::path::Path, id: &str, output: &str) -> TaskNode {
        let path = dir.join(format!("{output}.txt"));
        let slot = output.to_owned();
        TaskNode::new(
            id,
            move |_: &ActionContext<'_>| -> Result<ActionOutput, ActionError> {
                fs::write(&path, "out").map_err(|e| ActionError::new(e.to_string()))?;
                Ok(ActionOutput::new().with(slot.as_str(), vec![path.clone()]))
            },
        )
        .output(output)
    }

    fn tasks(dir: &std::path::Path, a_config: &str) -> Vec<TaskNode> {
        vec![
            writer(dir, "a", "x").input("src").config(a_config),
            writer(dir, "b", "y").input("x"),
            writer(dir, "c", "z"),
        ]
    }

    fn actions(entries: &[PlanEntry]) -> Vec<(&str, PlannedAction)> {
        entries
            .iter()
            .map(|entry| (entry.task.as_str(), entry.action))
            .collect()
    }

    #[test]
    fn plan_without_history_runs_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let registry = registry();
        let graph = GraphBuilder::new(&registry)
            .supply("src")
            .build(tasks(dir.path(), ""))
            .unwrap();
        let supplies = [Supply::new("src", vec![dir.path().join("src")])];
        let store = ArtifactStore::empty(&dir.path().join("state.json"));

        let entries = plan(&graph, &supplies, &store, &SessionConfig::default()).unwrap();
        assert_eq!(
            actions(&entries),
            [
                ("a", PlannedAction::Execute(ExecutionReason::NoHistory)),
                ("b", PlannedAction::AfterUpstream),
                ("c", PlannedAction::Execute(ExecutionReason::NoHistory)),
            ]
        );
        assert!(!dir.path().join("x.txt").exists());
        assert!(!dir.path().join("state.json").exists());
    }

    #[test]
    fn plan_matches_incremental_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let registry = registry();
        let supplies = [Supply::new("src", vec![dir.path().join("src")])];
        let state = dir.path().join("state.json");

        let store = ArtifactStore::load(&state).unwrap();
        run_build(
            &registry,
            tasks(dir.path(), ""),
            &supplies,
            &store,
            &SessionConfig::default(),
        )
        .unwrap();

        let store = ArtifactStore::load(&state).unwrap();
        let graph = GraphBuilder::new(&registry)
            .supply("src")
            .build(tasks(dir.path(), ""))
            .unwrap();
        let entries = plan(&graph, &supplies, &store, &SessionConfig::default()).unwrap();
        assert!(entries.iter().all(|e| e.action == PlannedAction::UpToDate));

        fs::write(dir.path().join("src").join("new.txt"), "changed").unwrap();
        let entries = plan(&graph, &supplies, &store, &SessionConfig::default()).unwrap();
        assert_eq!(
            actions(&entries),
            [
                ("a", PlannedAction::Execute(ExecutionReason::InputsChanged)),
                ("b", PlannedAction::AfterUpstream),
                ("c", PlannedAction::UpToDate),
            ]
        );
    }

    #[test]
    fn change_reaches_every_downstream_task() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let registry = registry();
        let supplies = [Supply::new("src", vec![dir.path().join("src")])];
        let chain = || {
            vec![
                writer(dir.path(), "a", "x").input("src"),
                writer(dir.path(), "b", "y").input("x"),
                writer(dir.path(), "c", "z").input("y"),
            ]
        };
        let state = dir.path().join("state.json");
        let store = ArtifactStore::load(&state).unwrap();
        run_build(&registry, chain(), &supplies, &store, &SessionConfig::default()).unwrap();

        fs::write(dir.path().join("src").join("more.txt"), "more").unwrap();
        let store = ArtifactStore::load(&state).unwrap();
        let graph = GraphBuilder::new(&registry)
            .supply("src")
            .build(chain())
            .unwrap();
        let entries = plan(&graph, &supplies, &store, &SessionConfig::default()).unwrap();
        assert_eq!(
            actions(&entries),
            [
                ("a", PlannedAction::Execute(ExecutionReason::InputsChanged)),
                ("b", PlannedAction::AfterUpstream),
                ("c", PlannedAction::AfterUpstream),
            ]
        );
    }

    #[test]
    fn forced_plan_runs_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let registry = registry();
        let graph = GraphBuilder::new(&registry)
            .supply("src")
            .build(tasks(dir.path(), ""))
            .unwrap();
        let supplies = [Supply::new("src", vec![dir.path().join("src")])];
        let store = ArtifactStore::empty(&dir.path().join("state.json"));
        let config = SessionConfig {
            force_rebuild_all: true,
            ..SessionConfig::default()
        };
        let entries = plan(&graph, &supplies, &store, &config).unwrap();
        assert!(entries.iter().all(|e| e.action.would_execute()));
        assert_eq!(entries.len(), 3);
    }
}
