//! Process execution helpers for Kiln.

use std::path::Path;
use std::process::Command;

use crate::error::UtilError;

/// Structured output from a command execution.
#[derive(Debug)]
pub struct CommandOutput {
    /// Standard output as a string.
    pub stdout: String,
    /// Standard error as a string.
    pub stderr: String,
    /// Whether the command exited successfully.
    pub success: bool,
    /// The exit code, if the process was not killed by a signal.
    pub exit_code: Option<i32>,
}

/// Run `argv` in `cwd` with extra environment variables and capture its output.
///
/// The first element of `argv` is the program; the rest are its arguments.
///
/// # Errors
/// Returns an error if `argv` is empty or the program cannot be spawned.
/// A non-zero exit code is **not** an error; check `CommandOutput::success` instead.
pub fn run_argv(
    argv: &[String],
    cwd: &Path,
    env: &[(String, String)],
) -> Result<CommandOutput, UtilError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(UtilError::EmptyCommand);
    };

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.output().map_err(|source| UtilError::CommandExec {
        program: program.clone(),
        source,
    })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
        exit_code: output.status.code(),
    })
}
