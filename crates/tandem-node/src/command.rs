//! Running the system tools the node platform is built on.

use std::fmt;
use std::io::Write;
use std::process::{Command, ExitStatus, Output, Stdio};

use tandem_failover::HaError;
use tandem_target::TargetError;

#[derive(Debug)]
pub struct CommandFailure {
    command: String,
    status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command [{}] failed with status {}",
            self.command, self.status
        )?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("failed to start [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailure>),

    #[error("failed to parse output of [{command}]: {reason}")]
    ParseFailure { command: String, reason: String },
}

impl From<ExecutionError> for HaError {
    fn from(err: ExecutionError) -> Self {
        HaError::platform(err)
    }
}

impl From<ExecutionError> for TargetError {
    fn from(err: ExecutionError) -> Self {
        TargetError::Backend(err.to_string())
    }
}

pub fn command_to_string(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn output_to_exec_error(command: &Command, output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailure {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }))
}

/// Runs `command` to completion and fails on a non-zero exit.
pub fn execute(command: &mut Command) -> Result<Output, ExecutionError> {
    let output = command
        .output()
        .map_err(|err| ExecutionError::ExecutionStart {
            command: command_to_string(command),
            err,
        })?;

    if !output.status.success() {
        return Err(output_to_exec_error(command, &output));
    }
    tracing::trace!(command = %command_to_string(command), "executed");
    Ok(output)
}

/// Like [`execute`], feeding `input` on stdin.
pub fn execute_with_input(command: &mut Command, input: &[u8]) -> Result<Output, ExecutionError> {
    let start_error = |command: &Command, err| ExecutionError::ExecutionStart {
        command: command_to_string(command),
        err,
    };
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| start_error(&*command, err))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .map_err(|err| start_error(&*command, err))?;
    }
    let output = child
        .wait_with_output()
        .map_err(|err| start_error(&*command, err))?;
    if !output.status.success() {
        return Err(output_to_exec_error(command, &output));
    }
    Ok(output)
}

/// Runs `command` and returns its stdout as text.
pub fn stdout(command: &mut Command) -> Result<String, ExecutionError> {
    let output = execute(command)?;
    String::from_utf8(output.stdout).map_err(|e| ExecutionError::ParseFailure {
        command: command_to_string(command),
        reason: e.to_string(),
    })
}

/// Runs `command` and returns its exit code, whatever it is.
///
/// A process killed by a signal reports -1.
pub fn exit_code(command: &mut Command) -> Result<i32, ExecutionError> {
    let status = command
        .status()
        .map_err(|err| ExecutionError::ExecutionStart {
            command: command_to_string(command),
            err,
        })?;
    Ok(status.code().unwrap_or(-1))
}
