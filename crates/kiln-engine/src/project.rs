//! Projects described by a `kiln.toml` manifest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use kiln_config::manifest::{CardinalityDecl, CategoryDecl, KindDecl, TaskDecl};
use kiln_config::Manifest;

use crate::command::CommandAction;
use crate::error::EngineError;
use crate::graph::{BuildGraph, GraphBuilder};
use crate::plan::PlanEntry;
use crate::session::{run_graph, CancellationToken, SessionConfig, SessionResult, Supply};
use crate::slot::{ArtifactSlot, Cardinality, Category, Registry, SlotId, SlotKind};
use crate::store::ArtifactStore;
use crate::task::{FingerprintPolicy, TaskId, TaskNode};

/// Name of the manifest file at a project root.
pub const MANIFEST_FILE: &str = "kiln.toml";

const STATE_FILE: &str = "state.json";

/// Command-line overrides for a build or plan.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Tasks to build along with their dependencies. Empty means all tasks.
    pub targets: Vec<String>,
    /// Overrides `build.max_parallelism`.
    pub jobs: Option<usize>,
    pub fail_fast: bool,
    /// Ignore recorded history and run every selected task.
    pub force: bool,
}

/// A loaded project: its registry, external sources, and tasks.
#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    manifest: Manifest,
    registry: Registry,
    supplies: Vec<Supply>,
    tasks: Vec<TaskNode>,
}

impl Project {
    /// Read `kiln.toml` from `root` and turn it into slots and tasks.
    ///
    /// The well-known slots are always declared; the manifest adds its own.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be read or is invalid, or if a
    /// slot declaration conflicts with another.
    pub fn load(root: &Path) -> Result<Self, EngineError> {
        let manifest = Manifest::from_path(&root.join(MANIFEST_FILE))?;
        Self::from_manifest(root, manifest)
    }

    /// Build a project from an already parsed manifest.
    ///
    /// # Errors
    /// Returns an error if a slot declaration is invalid or duplicated.
    pub fn from_manifest(root: &Path, manifest: Manifest) -> Result<Self, EngineError> {
        let mut registry = Registry::with_well_known();
        for decl in &manifest.slots {
            registry.declare(ArtifactSlot::from_parts(
                decl.id.as_str(),
                cardinality(decl.cardinality),
                kind(decl.kind),
                category(decl.category),
                decl.appendable,
            ))?;
        }

        let supplies = manifest
            .sources
            .iter()
            .map(|source| {
                Supply::new(
                    source.slot.as_str(),
                    source.paths.iter().map(|p| root.join(p)).collect(),
                )
            })
            .collect();

        let tasks = manifest
            .tasks
            .iter()
            .map(|decl| task_node(root, decl))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            registry,
            supplies,
            tasks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn supplies(&self) -> &[Supply] {
        &self.supplies
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.manifest.build.state_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    /// The validated graph, narrowed to `targets` and their dependencies
    /// when any are given.
    ///
    /// # Errors
    /// Returns a graph construction error, or [`EngineError::UnknownTask`]
    /// for a target that does not exist.
    pub fn graph(&self, targets: &[String]) -> Result<BuildGraph, EngineError> {
        let builder = self
            .supplies
            .iter()
            .fold(GraphBuilder::new(&self.registry), |builder, supply| {
                builder.supply(supply.slot.clone())
            });
        let graph = builder.build(self.tasks.clone())?;
        if targets.is_empty() {
            return Ok(graph);
        }
        let ids: Vec<TaskId> = targets.iter().map(|t| TaskId::new(t.as_str())).collect();
        graph.select(&ids)
    }

    /// Merge manifest settings with command-line overrides.
    pub fn session_config(&self, options: &BuildOptions) -> SessionConfig {
        let settings = &self.manifest.build;
        let defaults = SessionConfig::default();
        SessionConfig {
            max_parallelism: options
                .jobs
                .or(settings.max_parallelism)
                .unwrap_or(defaults.max_parallelism),
            fail_fast: options.fail_fast || settings.fail_fast,
            force_rebuild_all: options.force || settings.force_rebuild_all,
        }
    }

    /// Run a build session against the project's persisted state.
    ///
    /// # Errors
    /// Returns an error if the graph is invalid, a source is missing, or the
    /// worker pool cannot start. Task failures are reported in the result.
    pub fn build(
        &self,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<SessionResult, EngineError> {
        let graph = self.graph(&options.targets)?;
        let config = self.session_config(options);
        let store = ArtifactStore::load_or_empty(&self.state_path());
        run_graph(&self.registry, &graph, &self.supplies, &store, &config, cancel)
    }

    /// Predict what [`Project::build`] would do.
    ///
    /// # Errors
    /// Returns an error if the graph is invalid or a source is missing.
    pub fn plan(&self, options: &BuildOptions) -> Result<Vec<PlanEntry>, EngineError> {
        let graph = self.graph(&options.targets)?;
        let config = self.session_config(options);
        let store = ArtifactStore::load_or_empty(&self.state_path());
        crate::plan::plan(&graph, &self.supplies, &store, &config)
    }

    /// Delete the persisted build state. Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns an error if the state directory exists but cannot be removed.
    pub fn clean(&self) -> Result<bool, EngineError> {
        let dir = self.state_dir();
        let existed = dir.exists();
        kiln_util::fs::remove_dir_all_if_exists(&dir)?;
        Ok(existed)
    }
}

fn task_node(root: &Path, decl: &TaskDecl) -> Result<TaskNode, EngineError> {
    let mut action = CommandAction::new(root, decl.command.clone());
    for (key, value) in &decl.env {
        action = action.env(key.as_str(), value.as_str());
    }
    for output in &decl.outputs {
        action = action.output(
            output.slot.as_str(),
            output.paths.iter().map(PathBuf::from).collect(),
        );
    }

    let mut node = TaskNode::new(decl.id.as_str(), action).config(&decl.config_source()?);
    for input in &decl.inputs {
        node = node.input(input.as_str());
    }
    for output in &decl.outputs {
        node = node.output(output.slot.as_str());
    }
    if let Some(only) = &decl.fingerprint_inputs {
        let slots: BTreeSet<SlotId> = only.iter().map(|s| SlotId::new(s.as_str())).collect();
        node = node.policy(FingerprintPolicy::Only(slots));
    }
    Ok(node)
}

fn kind(decl: KindDecl) -> SlotKind {
    match decl {
        KindDecl::File => SlotKind::File,
        KindDecl::Directory => SlotKind::Directory,
    }
}

fn cardinality(decl: CardinalityDecl) -> Cardinality {
    match decl {
        CardinalityDecl::Single => Cardinality::Single,
        CardinalityDecl::Multiple => Cardinality::Multiple,
    }
}

fn category(decl: CategoryDecl) -> Category {
    match decl {
        CategoryDecl::Sources => Category::Sources,
        CategoryDecl::Intermediates => Category::Intermediates,
        CategoryDecl::Outputs => Category::Outputs,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::plan::PlannedAction;
    use crate::scheduler::{SkipReason, TaskOutcome};

    const MANIFEST: &str = r#"
[build]
max_parallelism = 2

[[slot]]
id = "sources"
kind = "directory"
category = "sources"

[[slot]]
id = "upper"
kind = "file"

[[slot]]
id = "reports"
kind = "directory"
cardinality = "multiple"
category = "outputs"
appendable = true

[[source]]
slot = "sources"
paths = ["src"]

[[task]]
id = "uppercase"
inputs = ["sources"]
outputs = [{ slot = "upper", paths = ["build/upper.txt"] }]
command = ["sh", "-c", "cat src/*.txt | tr a-z A-Z > \"$KILN_OUTPUT_UPPER\""]

[[task]]
id = "size"
inputs = ["upper"]
outputs = [{ slot = "reports", paths = ["build/reports/size"] }]
command = ["sh", "-c", "mkdir -p build/reports/size && wc -c < build/upper.txt > build/reports/size/bytes.txt"]

[[task]]
id = "listing"
inputs = ["sources"]
outputs = [{ slot = "reports", paths = ["build/reports/listing"] }]
command = ["sh", "-c", "mkdir -p build/reports/listing && ls src > build/reports/listing/files.txt"]
"#;

    fn project_dir() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), MANIFEST).unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/hello.txt"), "hello\n").unwrap();
        tmp
    }

    fn up_to_date(result: &SessionResult, task: &str) -> bool {
        result.outcome(&TaskId::new(task)) == Some(&TaskOutcome::Skipped(SkipReason::UpToDate))
    }

    #[test]
    fn load_declares_manifest_and_well_known_slots() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        assert!(project.registry().contains(&SlotId::new("dex")));
        let reports = project.registry().lookup(&SlotId::new("reports")).unwrap();
        assert!(reports.is_appendable());
        assert_eq!(project.supplies().len(), 1);
        assert_eq!(project.state_path(), tmp.path().join(".kiln/state.json"));
    }

    #[test]
    fn build_then_rebuild_is_incremental() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        let options = BuildOptions::default();
        let cancel = CancellationToken::new();

        let first = project.build(&options, &cancel).unwrap();
        assert!(first.is_success(), "first build: {:?}", first.reports);
        assert_eq!(first.summary().executed, 3);
        assert_eq!(
            fs::read_to_string(tmp.path().join("build/upper.txt")).unwrap(),
            "HELLO\n"
        );
        assert!(project.state_path().exists());

        let second = project.build(&options, &cancel).unwrap();
        assert_eq!(second.summary().up_to_date, 3);

        fs::write(tmp.path().join("src/hello.txt"), "changed\n").unwrap();
        let third = project.build(&options, &cancel).unwrap();
        assert_eq!(third.summary().executed, 3);
    }

    #[test]
    fn targets_limit_the_session() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        let options = BuildOptions {
            targets: vec!["uppercase".to_owned()],
            ..BuildOptions::default()
        };
        let result = project.build(&options, &CancellationToken::new()).unwrap();
        assert_eq!(result.reports.len(), 1);
        assert!(!tmp.path().join("build/reports").exists());
    }

    #[test]
    fn targeted_build_keeps_history_of_other_tasks() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        let cancel = CancellationToken::new();
        project.build(&BuildOptions::default(), &cancel).unwrap();

        let only_upper = BuildOptions {
            targets: vec!["uppercase".to_owned()],
            ..BuildOptions::default()
        };
        let partial = project.build(&only_upper, &cancel).unwrap();
        assert!(up_to_date(&partial, "uppercase"));

        let full = project.build(&BuildOptions::default(), &cancel).unwrap();
        assert_eq!(full.summary().up_to_date, 3, "{:?}", full.reports);
    }

    #[test]
    fn moving_an_output_path_reruns_the_producer() {
        let tmp = project_dir();
        let cancel = CancellationToken::new();
        Project::load(tmp.path())
            .unwrap()
            .build(&BuildOptions::default(), &cancel)
            .unwrap();

        let edited = MANIFEST.replace(
            r#"paths = ["build/upper.txt"]"#,
            r#"paths = ["build/upper2.txt"]"#,
        );
        fs::write(tmp.path().join(MANIFEST_FILE), edited).unwrap();
        let result = Project::load(tmp.path())
            .unwrap()
            .build(&BuildOptions::default(), &cancel)
            .unwrap();

        assert!(matches!(
            result.outcome(&TaskId::new("uppercase")),
            Some(TaskOutcome::Executed { .. })
        ));
        assert!(up_to_date(&result, "listing"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("build/upper2.txt")).unwrap(),
            "HELLO\n"
        );
    }

    #[test]
    fn unknown_target_fails() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        let options = BuildOptions {
            targets: vec!["nope".to_owned()],
            ..BuildOptions::default()
        };
        let err = project.plan(&options).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTask { .. }));
    }

    #[test]
    fn manifest_config_change_reruns_task() {
        let tmp = project_dir();
        let cancel = CancellationToken::new();
        Project::load(tmp.path())
            .unwrap()
            .build(&BuildOptions::default(), &cancel)
            .unwrap();

        let edited = MANIFEST.replace(
            "ls src > build/reports/listing/files.txt",
            "ls -1 src > build/reports/listing/files.txt",
        );
        fs::write(tmp.path().join(MANIFEST_FILE), edited).unwrap();
        let project = Project::load(tmp.path()).unwrap();

        let plan = project.plan(&BuildOptions::default()).unwrap();
        let listing = plan
            .iter()
            .find(|e| e.task.as_str() == "listing")
            .unwrap();
        assert!(listing.action.would_execute());

        let result = project.build(&BuildOptions::default(), &cancel).unwrap();
        assert!(up_to_date(&result, "uppercase"));
        assert!(up_to_date(&result, "size"));
        assert!(!up_to_date(&result, "listing"));
    }

    #[test]
    fn plan_after_build_is_all_up_to_date() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        project
            .build(&BuildOptions::default(), &CancellationToken::new())
            .unwrap();
        let plan = project.plan(&BuildOptions::default()).unwrap();
        assert!(plan.iter().all(|e| e.action == PlannedAction::UpToDate));
    }

    #[test]
    fn session_config_prefers_command_line() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        let config = project.session_config(&BuildOptions::default());
        assert_eq!(config.max_parallelism, 2);
        assert!(!config.fail_fast);

        let config = project.session_config(&BuildOptions {
            jobs: Some(7),
            fail_fast: true,
            ..BuildOptions::default()
        });
        assert_eq!(config.max_parallelism, 7);
        assert!(config.fail_fast);
    }

    #[test]
    fn clean_removes_state() {
        let tmp = project_dir();
        let project = Project::load(tmp.path()).unwrap();
        assert!(!project.clean().unwrap());
        project
            .build(&BuildOptions::default(), &CancellationToken::new())
            .unwrap();
        assert!(project.clean().unwrap());
        assert!(!project.state_dir().exists());

        let result = project
            .build(&BuildOptions::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.summary().executed, 3);
    }

    #[test]
    fn duplicate_well_known_slot_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(MANIFEST_FILE),
            "[[slot]]\nid = \"dex\"\nkind = \"directory\"\n",
        )
        .unwrap();
        let err = Project::load(tmp.path()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSlot { .. }));
    }

    #[test]
    fn missing_manifest_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Project::load(tmp.path()).unwrap_err();
        assert!(matches!(err, EngineError::Manifest(_)));
    }
}
