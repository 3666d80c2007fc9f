//! In-memory stand-ins for the host services, for tests.
//!
//! [`FakeRunner`] records every command it is asked to run and answers from
//! a small rule table; [`FakeMounts`] and [`FakeDaemon`] model the mount
//! table and brick processes.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::brick::BrickRecord;
use crate::error::{Result, SnapshotError};
use crate::exec::{CommandOutput, CommandRunner};
use crate::host::{BrickDaemon, MountEntry, MountOps};

struct Rule {
    prefix: Vec<String>,
    output: CommandOutput,
}

/// A [`CommandRunner`] that answers from canned responses.
///
/// Rules match on a prefix of the argument vector (program included); the
/// most recently added matching rule wins. Unmatched commands succeed with
/// empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    missing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, prefix: &str, output: CommandOutput) {
        let prefix = prefix.split_whitespace().map(str::to_string).collect();
        self.rules.lock().unwrap().push(Rule { prefix, output });
    }

    /// Answer commands starting with `prefix` with `stdout` and exit 0.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.add_rule(
            prefix,
            CommandOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    /// Fail commands starting with `prefix` with the given status and stderr.
    pub fn fail_when(&self, prefix: &str, status: i32, stderr: &str) {
        self.add_rule(
            prefix,
            CommandOutput {
                status,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Pretend `program` is not installed.
    pub fn mark_missing(&self, program: &str) {
        self.missing.lock().unwrap().insert(program.to_string());
    }

    /// Every command run so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands run so far whose program is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(program))
            .collect()
    }

    /// Commands rendered as single strings, handy for assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|argv| argv.join(" ")).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        if self.missing.lock().unwrap().contains(program) {
            return Err(SnapshotError::ToolUnavailable(program.to_string()));
        }

        let argv: Vec<String> = std::iter::once(program)
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect();
        self.calls.lock().unwrap().push(argv.clone());

        let rules = self.rules.lock().unwrap();
        let output = rules
            .iter()
            .rev()
            .find(|rule| argv.starts_with(&rule.prefix))
            .map(|rule| rule.output.clone())
            .unwrap_or_default();
        Ok(output)
    }

    fn is_available(&self, program: &str) -> bool {
        !self.missing.lock().unwrap().contains(program)
    }
}

/// A [`MountOps`] over an in-memory mount table.
///
/// A path resolves to the longest registered mount point that contains it.
#[derive(Default)]
pub struct FakeMounts {
    entries: Mutex<BTreeMap<PathBuf, MountEntry>>,
    umount_failures: Mutex<u32>,
    umounts: Mutex<Vec<PathBuf>>,
    created: Mutex<Vec<PathBuf>>,
    removed: Mutex<Vec<PathBuf>>,
    remove_dir_error: Mutex<Option<ErrorKind>>,
}

impl FakeMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filesystem mounted at `dir`.
    pub fn add_mount(&self, fsname: &str, dir: impl Into<PathBuf>, fstype: &str) {
        let dir = dir.into();
        self.entries.lock().unwrap().insert(
            dir.clone(),
            MountEntry {
                fsname: fsname.to_string(),
                dir,
                fstype: fstype.to_string(),
                opts: "rw".to_string(),
            },
        );
    }

    /// Make the next `count` unmounts fail; `u32::MAX` fails them all.
    pub fn fail_umounts(&self, count: u32) {
        *self.umount_failures.lock().unwrap() = count;
    }

    /// Make `remove_dir` fail with the given error kind.
    pub fn fail_remove_dir(&self, kind: ErrorKind) {
        *self.remove_dir_error.lock().unwrap() = Some(kind);
    }

    /// Every unmount attempt, in order.
    pub fn umounts(&self) -> Vec<PathBuf> {
        self.umounts.lock().unwrap().clone()
    }

    /// Directories created with `mkdir_p`.
    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.created.lock().unwrap().clone()
    }

    /// Directories removed with `remove_dir` or `remove_dir_all`.
    pub fn removed_dirs(&self) -> Vec<PathBuf> {
        self.removed.lock().unwrap().clone()
    }
}

impl MountOps for FakeMounts {
    fn brick_root(&self, path: &Path) -> Result<PathBuf> {
        self.entries
            .lock()
            .unwrap()
            .keys()
            .filter(|dir| path.starts_with(dir))
            .max_by_key(|dir| dir.components().count())
            .cloned()
            .ok_or_else(|| SnapshotError::BrickRoot(path.to_path_buf()))
    }

    fn mount_entry(&self, mount_root: &Path) -> Result<MountEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(mount_root)
            .cloned()
            .ok_or_else(|| SnapshotError::MountEntryNotFound(mount_root.to_path_buf()))
    }

    fn umount(&self, target: &Path) -> Result<()> {
        self.umounts.lock().unwrap().push(target.to_path_buf());

        let mut failures = self.umount_failures.lock().unwrap();
        if *failures > 0 {
            if *failures != u32::MAX {
                *failures -= 1;
            }
            return Err(SnapshotError::CommandFailed {
                command: format!("umount {}", target.display()),
                status: 32,
                stderr: "target is busy".to_string(),
            });
        }
        Ok(())
    }

    fn mkdir_p(&self, path: &Path) -> Result<()> {
        self.created.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        if let Some(kind) = *self.remove_dir_error.lock().unwrap() {
            return Err(io::Error::from(kind).into());
        }
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// A [`BrickDaemon`] with a fixed set of running pid files.
#[derive(Default)]
pub struct FakeDaemon {
    running: Mutex<BTreeMap<PathBuf, u32>>,
    terminated: Mutex<Vec<(String, u32)>>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the process recorded in `pidfile` as running.
    pub fn set_running(&self, pidfile: impl Into<PathBuf>, pid: u32) {
        self.running.lock().unwrap().insert(pidfile.into(), pid);
    }

    /// `(brick identity, pid)` for every termination request.
    pub fn terminated(&self) -> Vec<(String, u32)> {
        self.terminated.lock().unwrap().clone()
    }
}

impl BrickDaemon for FakeDaemon {
    fn running_pid(&self, pidfile: &Path) -> Option<u32> {
        self.running.lock().unwrap().get(pidfile).copied()
    }

    fn terminate(&self, brick: &BrickRecord, pid: u32) -> Result<()> {
        self.terminated
            .lock()
            .unwrap()
            .push((brick.identity(), pid));
        self.running.lock().unwrap().retain(|_, running| *running != pid);
        Ok(())
    }
}
