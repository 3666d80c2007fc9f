//! Native command execution.
//!
//! Every backend reaches the host's storage tooling (`lvs`, `btrfs`, `zfs`,
//! `mount`, ...) through a [`CommandRunner`]. Production code uses
//! [`HostRunner`]; tests substitute `FakeRunner` from the `fakes` module.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, SnapshotError};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was terminated by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// First line of stdout with surrounding whitespace trimmed.
    ///
    /// Returns `None` when stdout is empty or the first line is blank.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Runs a program with an argument vector and waits for it to exit.
pub trait CommandRunner: Send + Sync {
    /// Execute `program` with `args`, capturing stdout and stderr.
    ///
    /// A non-zero exit is *not* an error here; only a failure to start the
    /// process is. Use [`run_checked`] when a non-zero exit should fail.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Whether `program` can be found on this host.
    fn is_available(&self, program: &str) -> bool;
}

/// Render an argument vector for log and error messages.
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command and map a non-zero exit into [`SnapshotError::CommandFailed`].
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput> {
    let output = runner.run(program, args)?;
    if output.success() {
        return Ok(output);
    }

    Err(SnapshotError::CommandFailed {
        command: command_line(program, args),
        status: output.status,
        stderr: output.stderr.trim().to_string(),
    })
}

/// Runs commands on the local host with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(command = %command_line(program, args), "Running command");

        let output = Command::new(program).args(args).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SnapshotError::ToolUnavailable(program.to_string())
            } else {
                SnapshotError::Io(e)
            }
        })?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(
            program,
            status = result.status,
            "Command finished"
        );
        Ok(result)
    }

    fn is_available(&self, program: &str) -> bool {
        if program.contains('/') {
            return Path::new(program).is_file();
        }

        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }
}
