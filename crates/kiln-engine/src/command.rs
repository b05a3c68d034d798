//! Task actions that run an external command.

use std::path::{Path, PathBuf};

use crate::slot::SlotId;
use crate::task::{ActionContext, ActionError, ActionOutput, TaskAction};

/// Runs a program with a fixed argument list and reports fixed output paths.
///
/// Input and output locations are passed to the program through environment
/// variables: `KILN_TASK` holds the task id, and each slot gets
/// `KILN_INPUT_<SLOT>` or `KILN_OUTPUT_<SLOT>`, where `<SLOT>` is the slot id
/// upper-cased with every non-alphanumeric character replaced by `_`. Multiple
/// locations are joined with the platform path separator.
#[derive(Debug, Clone)]
pub struct CommandAction {
    cwd: PathBuf,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    outputs: Vec<(SlotId, Vec<PathBuf>)>,
}

impl CommandAction {
    pub fn new(cwd: &Path, argv: Vec<String>) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            argv,
            env: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Declare where the command writes `slot`. Relative paths resolve
    /// against the working directory.
    #[must_use]
    pub fn output(mut self, slot: impl Into<SlotId>, paths: Vec<PathBuf>) -> Self {
        let paths = paths
            .into_iter()
            .map(|p| if p.is_absolute() { p } else { self.cwd.join(p) })
            .collect();
        self.outputs.push((slot.into(), paths));
        self
    }

    fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

impl TaskAction for CommandAction {
    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let mut env = self.env.clone();
        env.push(("KILN_TASK".to_owned(), ctx.task().to_string()));
        for (slot, paths) in ctx.inputs() {
            env.push((env_key("KILN_INPUT_", slot), join_paths(paths)?));
        }
        for (slot, paths) in &self.outputs {
            env.push((env_key("KILN_OUTPUT_", slot), join_paths(paths)?));
            for path in paths {
                if let Some(parent) = path.parent() {
                    kiln_util::fs::ensure_dir(parent)?;
                }
            }
        }

        if ctx.is_cancelled() {
            return Err(ActionError::new("cancelled before start"));
        }

        let output = kiln_util::process::run_argv(&self.argv, &self.cwd, &env)?;
        if !output.success {
            let code = output
                .exit_code
                .map_or_else(|| "a signal".to_owned(), |c| format!("code {c}"));
            let stderr = output.stderr.trim();
            let mut message = format!("`{}` exited with {code}", self.program());
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(stderr);
            }
            return Err(ActionError::new(message));
        }
        if !output.stdout.trim().is_empty() {
            tracing::debug!(task = %ctx.task(), stdout = %output.stdout.trim(), "command output");
        }

        Ok(self
            .outputs
            .iter()
            .fold(ActionOutput::new(), |acc, (slot, paths)| {
                acc.with(slot.clone(), paths.clone())
            }))
    }
}

fn env_key(prefix: &str, slot: &SlotId) -> String {
    let suffix: String = slot
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}{suffix}")
}

fn join_paths(paths: &[PathBuf]) -> Result<String, ActionError> {
    let joined = std::env::join_paths(paths)
        .map_err(|e| ActionError::new(format!("cannot pass paths to command: {e}")))?;
    Ok(joined.to_string_lossy().into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use super::*;
    use crate::session::CancellationToken;
    use crate::task::TaskId;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    fn run(action: &CommandAction, inputs: &BTreeMap<SlotId, Vec<PathBuf>>) -> Result<ActionOutput, ActionError> {
        let id = TaskId::new("compile-res");
        let cancel = CancellationToken::new();
        let ctx = ActionContext::new(&id, inputs, &[], &cancel);
        action.execute(&ctx)
    }

    #[test]
    fn env_key_sanitizes_slot_ids() {
        assert_eq!(
            env_key("KILN_INPUT_", &SlotId::new("res-compiled.flat")),
            "KILN_INPUT_RES_COMPILED_FLAT"
        );
    }

    #[test]
    fn command_sees_inputs_and_writes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in.txt");
        fs::write(&input, "hello").unwrap();

        let action = CommandAction::new(tmp.path(), sh("cat \"$KILN_INPUT_SRC\" > \"$KILN_OUTPUT_OUT\""))
            .output("out", vec![PathBuf::from("build/out.txt")]);
        let inputs = [(SlotId::new("src"), vec![input])].into();

        let output = run(&action, &inputs).unwrap();
        let produced = tmp.path().join("build/out.txt");
        assert_eq!(output.get(&SlotId::new("out")).unwrap(), [produced.clone()]);
        assert_eq!(fs::read_to_string(produced).unwrap(), "hello");
    }

    #[test]
    fn command_gets_task_id_and_extra_env() {
        let tmp = tempfile::tempdir().unwrap();
        let action = CommandAction::new(tmp.path(), sh("echo \"$KILN_TASK $MODE\" > out.txt"))
            .env("MODE", "release")
            .output("out", vec![PathBuf::from("out.txt")]);
        run(&action, &BTreeMap::new()).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("out.txt")).unwrap().trim(),
            "compile-res release"
        );
    }

    #[test]
    fn failing_command_reports_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let action = CommandAction::new(tmp.path(), sh("echo 'aapt2 error' >&2; exit 3"));
        let err = run(&action, &BTreeMap::new()).unwrap_err();
        assert!(err.message().contains("code 3"), "message was: {}", err.message());
        assert!(err.message().contains("aapt2 error"), "message was: {}", err.message());
    }

    #[test]
    fn empty_command_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let action = CommandAction::new(tmp.path(), Vec::new());
        assert!(run(&action, &BTreeMap::new()).is_err());
    }
}
