#![forbid(unsafe_code)]

mod logging;

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use kiln_engine::{
    BuildOptions, CancellationToken, Category, PlanEntry, Project, SessionResult, SkipReason,
    SlotKind, TaskOutcome, MANIFEST_FILE,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(name = "kiln", about = "An incremental, artifact-driven task runner")]
#[command(version)]
struct Cli {
    /// Show debug logging from the engine
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new Kiln project
    Init {
        /// Project name (also the directory to create)
        #[arg(long)]
        name: Option<String>,
    },
    /// Run tasks whose inputs changed
    Build {
        /// Tasks to build, with their dependencies (defaults to all)
        tasks: Vec<String>,
        /// Maximum number of tasks running at once
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
        /// Stop starting new tasks after the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Run every task, ignoring recorded history
        #[arg(long)]
        force: bool,
    },
    /// Show which tasks a build would run, without running them
    Plan {
        /// Tasks to plan, with their dependencies (defaults to all)
        tasks: Vec<String>,
        /// Plan as if every task were forced
        #[arg(long)]
        force: bool,
    },
    /// Print tasks in dependency order with their slots
    Graph,
    /// List declared artifact slots
    Slots,
    /// Remove persisted build state
    Clean,
}

fn main() {
    let cli = Cli::parse();

    if let Err(msg) = logging::init(cli.verbose) {
        eprintln!("warning: logging disabled: {msg}");
    }

    let result = match cli.command {
        Command::Init { name } => cmd_init(name),
        Command::Build {
            tasks,
            jobs,
            fail_fast,
            force,
        } => cmd_build(BuildOptions {
            targets: tasks,
            jobs,
            fail_fast,
            force,
        }),
        Command::Plan { tasks, force } => cmd_plan(&BuildOptions {
            targets: tasks,
            force,
            ..BuildOptions::default()
        }),
        Command::Graph => cmd_graph(),
        Command::Slots => cmd_slots(),
        Command::Clean => cmd_clean(),
    };

    if let Err(msg) = result {
        eprintln!("error: {msg}");
        process::exit(1);
    }
}

/// Find the project root by looking for `kiln.toml` in the current directory.
fn project_root() -> Result<PathBuf, Box<dyn Error>> {
    let cwd = std::env::current_dir()?;
    if !cwd.join(MANIFEST_FILE).exists() {
        return Err(format!(
            "no {MANIFEST_FILE} found in current directory; run `kiln init` to create a project"
        )
        .into());
    }
    Ok(cwd)
}

fn load_project() -> Result<Project, Box<dyn Error>> {
    let root = project_root()?;
    Ok(Project::load(&root)?)
}

fn cmd_init(name: Option<String>) -> CliResult {
    let cwd = std::env::current_dir()?;
    let (project_name, project_dir) = match name {
        Some(name) => {
            let dir = cwd.join(&name);
            (name, dir)
        }
        None => {
            let name = cwd
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("kiln-project")
                .to_owned();
            (name, cwd.clone())
        }
    };

    kiln_engine::init_project(&project_name, &project_dir)?;

    eprintln!(
        "     Created project `{project_name}` at {}",
        project_dir.display()
    );
    eprintln!();
    eprintln!("  To get started:");
    if project_dir != cwd {
        eprintln!("    cd {project_name}");
    }
    eprintln!("    kiln build");
    Ok(())
}

fn cmd_build(options: BuildOptions) -> CliResult {
    let project = load_project()?;
    tracing::debug!(root = %project.root().display(), targets = ?options.targets, "loaded project");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("  Cancelling: waiting for running tasks to finish");
        on_interrupt.cancel();
    })?;

    let result = project.build(&options, &cancel)?;
    for report in &result.reports {
        eprintln!("{}", status_line(report.task.as_str(), &report.outcome));
    }
    if let Some(err) = &result.store_error {
        eprintln!("warning: build state was not saved: {err}");
    }
    eprintln!("{}", finish_line(&result));

    if result.is_success() {
        Ok(())
    } else if let Some(failure) = result.first_failure() {
        Err(failure.into())
    } else {
        Err("build cancelled".into())
    }
}

fn cmd_plan(options: &BuildOptions) -> CliResult {
    let project = load_project()?;
    let entries = project.plan(options)?;
    for entry in &entries {
        println!("{}", plan_line(entry));
    }
    let pending = entries.iter().filter(|e| e.action.would_execute()).count();
    eprintln!("    {pending} of {} task(s) would run", entries.len());
    Ok(())
}

fn cmd_graph() -> CliResult {
    let project = load_project()?;
    let graph = project.graph(&[])?;
    for index in graph.topological_order() {
        let Some(task) = graph.task(index) else {
            continue;
        };
        println!("{}", task.id());
        for slot in task.inputs() {
            let from: Vec<String> = graph
                .producers_of(slot)
                .iter()
                .filter_map(|&p| graph.task(p).map(|t| t.id().to_string()))
                .chain(graph.is_supplied(slot).then_some("source".to_owned()))
                .collect();
            println!("  <- {slot} ({})", from.join(", "));
        }
        for slot in task.outputs() {
            println!("  -> {slot}");
        }
    }
    Ok(())
}

fn cmd_slots() -> CliResult {
    let project = load_project()?;
    for slot in project.registry().iter() {
        let kind = match slot.kind() {
            SlotKind::File => "file",
            SlotKind::Directory => "directory",
        };
        let category = match slot.category() {
            Category::Sources => "sources",
            Category::Intermediates => "intermediates",
            Category::Outputs => "outputs",
        };
        let cardinality = match slot.cardinality() {
            kiln_engine::Cardinality::Single => "single",
            kiln_engine::Cardinality::Multiple => "multiple",
        };
        let appendable = if slot.is_appendable() {
            ", appendable"
        } else {
            ""
        };
        println!(
            "{:<28} {kind}, {cardinality}, {category}{appendable}",
            slot.id()
        );
    }
    Ok(())
}

fn cmd_clean() -> CliResult {
    let project = load_project()?;
    if project.clean()? {
        eprintln!("     Cleaned build state");
    } else {
        eprintln!("     Nothing to clean");
    }
    Ok(())
}

fn status_line(task: &str, outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Executed {
            reason, duration, ..
        } => format!(
            "    Executed {task} ({reason}, {:.2}s)",
            duration.as_secs_f64()
        ),
        TaskOutcome::Skipped(SkipReason::UpToDate) => format!("       Fresh {task}"),
        TaskOutcome::Skipped(reason) => format!("     Skipped {task} ({reason})"),
        TaskOutcome::Failed { error } => format!("      Failed {task}: {error}"),
    }
}

fn finish_line(result: &SessionResult) -> String {
    let summary = result.summary();
    let mut parts = vec![
        format!("{} executed", summary.executed),
        format!("{} up to date", summary.up_to_date),
    ];
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed));
    }
    if summary.blocked > 0 {
        parts.push(format!("{} blocked", summary.blocked));
    }
    if summary.cancelled > 0 {
        parts.push(format!("{} cancelled", summary.cancelled));
    }
    format!(
        "    Finished generation {} in {:.2}s: {}",
        result.generation,
        result.duration.as_secs_f64(),
        parts.join(", ")
    )
}

fn plan_line(entry: &PlanEntry) -> String {
    format!("{:<28} {}", entry.task, entry.action)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use clap::CommandFactory;
    use kiln_engine::{ExecutionReason, PlannedAction, TaskId, TaskReport};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_init_defaults() {
        let cli = Cli::try_parse_from(["kiln", "init"]).unwrap();
        match cli.command {
            Command::Init { name } => assert!(name.is_none()),
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn parse_init_with_name() {
        let cli = Cli::try_parse_from(["kiln", "init", "--name", "pipeline"]).unwrap();
        match cli.command {
            Command::Init { name } => assert_eq!(name.as_deref(), Some("pipeline")),
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn parse_build_defaults() {
        let cli = Cli::try_parse_from(["kiln", "build"]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Command::Build {
                tasks,
                jobs,
                fail_fast,
                force,
            } => {
                assert!(tasks.is_empty());
                assert!(jobs.is_none());
                assert!(!fail_fast);
                assert!(!force);
            }
            other => panic!("expected Build, got {other:?}"),
        }
    }

    #[test]
    fn parse_build_all_flags() {
        let args = [
            "kiln",
            "build",
            "package",
            "lint",
            "-j",
            "4",
            "--fail-fast",
            "--force",
            "--verbose",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Build {
                tasks,
                jobs,
                fail_fast,
                force,
            } => {
                assert_eq!(tasks, ["package", "lint"]);
                assert_eq!(jobs, Some(4));
                assert!(fail_fast);
                assert!(force);
            }
            other => panic!("expected Build, got {other:?}"),
        }
    }

    #[test]
    fn parse_build_rejects_non_numeric_jobs() {
        assert!(Cli::try_parse_from(["kiln", "build", "--jobs", "many"]).is_err());
    }

    #[test]
    fn parse_plan_with_force() {
        let cli = Cli::try_parse_from(["kiln", "plan", "dex", "--force"]).unwrap();
        match cli.command {
            Command::Plan { tasks, force } => {
                assert_eq!(tasks, ["dex"]);
                assert!(force);
            }
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[test]
    fn parse_simple_subcommands() {
        for (arg, expected) in [("graph", "Graph"), ("slots", "Slots"), ("clean", "Clean")] {
            let cli = Cli::try_parse_from(["kiln", arg]).unwrap();
            assert!(format!("{:?}", cli.command).starts_with(expected));
        }
    }

    #[test]
    fn parse_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["kiln", "deploy"]).is_err());
    }

    #[test]
    fn status_lines() {
        let fresh = status_line("dex", &TaskOutcome::Skipped(SkipReason::UpToDate));
        assert_eq!(fresh, "       Fresh dex");

        let blocked = status_line(
            "package",
            &TaskOutcome::Skipped(SkipReason::Blocked {
                failed: TaskId::new("dex"),
            }),
        );
        assert_eq!(blocked, "     Skipped package (blocked by `dex`)");

        let failed = status_line(
            "dex",
            &TaskOutcome::Failed {
                error: "exit 1".to_owned(),
            },
        );
        assert_eq!(failed, "      Failed dex: exit 1");
    }

    #[test]
    fn finish_line_lists_only_nonzero_problems() {
        let result = SessionResult {
            reports: vec![
                TaskReport {
                    task: TaskId::new("a"),
                    outcome: TaskOutcome::Skipped(SkipReason::UpToDate),
                },
                TaskReport {
                    task: TaskId::new("b"),
                    outcome: TaskOutcome::Failed {
                        error: "boom".to_owned(),
                    },
                },
            ],
            generation: 4,
            duration: Duration::from_millis(1500),
            store_error: None,
        };
        assert_eq!(
            finish_line(&result),
            "    Finished generation 4 in 1.50s: 0 executed, 1 up to date, 1 failed"
        );
    }

    #[test]
    fn plan_line_pads_task() {
        let entry = PlanEntry {
            task: TaskId::new("merge-dex"),
            action: PlannedAction::Execute(ExecutionReason::InputsChanged),
        };
        let line = plan_line(&entry);
        assert!(line.starts_with("merge-dex "));
        assert!(line.ends_with("run (inputs changed)"));
    }

    #[test]
    fn initialized_project_loads() {
        let tmp = tempfile::tempdir().unwrap();
        kiln_engine::init_project("demo", tmp.path()).unwrap();
        let project = Project::load(tmp.path()).unwrap();
        assert_eq!(project.root(), tmp.path());
    }
}
