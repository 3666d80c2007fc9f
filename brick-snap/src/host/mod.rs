//! Host services the backends depend on: mount table lookups, unmounting,
//! directory handling and brick daemon control.

pub mod mtab;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::brick::BrickRecord;
use crate::error::{Result, SnapshotError};
use crate::exec::{CommandRunner, run_checked};

pub use mtab::MountEntry;

/// Default mount table location on Linux.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Filesystem and mount helpers.
pub trait MountOps: Send + Sync {
    /// Mount point of the filesystem holding `path`.
    fn brick_root(&self, path: &Path) -> Result<PathBuf>;

    /// Mount table entry for the filesystem mounted at `mount_root`.
    fn mount_entry(&self, mount_root: &Path) -> Result<MountEntry>;

    /// Unmount `target` with the external `umount` command.
    fn umount(&self, target: &Path) -> Result<()>;

    /// Create `path` and any missing parents.
    fn mkdir_p(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Remove a directory tree.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Device backing the filesystem that holds `path`.
    fn brick_mount_device(&self, path: &Path) -> Result<String> {
        let root = self.brick_root(path)?;
        Ok(self.mount_entry(&root)?.fsname)
    }
}

/// Brick process control.
pub trait BrickDaemon: Send + Sync {
    /// Pid recorded in `pidfile` when that process is alive.
    fn running_pid(&self, pidfile: &Path) -> Option<u32>;

    /// Ask the brick process to shut down.
    fn terminate(&self, brick: &BrickRecord, pid: u32) -> Result<()>;
}

/// [`MountOps`] backed by the local mount table and the `umount` binary.
pub struct HostMounts {
    runner: Arc<dyn CommandRunner>,
    mount_table: PathBuf,
}

impl HostMounts {
    pub fn new(runner: Arc<dyn CommandRunner>, mount_table: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_table: mount_table.into(),
        }
    }
}

impl MountOps for HostMounts {
    fn brick_root(&self, path: &Path) -> Result<PathBuf> {
        mtab::find_mount_root(path).map_err(|e| {
            debug!(path = %path.display(), error = %e, "Failed to resolve brick root");
            SnapshotError::BrickRoot(path.to_path_buf())
        })
    }

    fn mount_entry(&self, mount_root: &Path) -> Result<MountEntry> {
        let contents = fs::read_to_string(&self.mount_table)?;
        let entries = mtab::parse_mount_table(&contents);
        mtab::find_entry(&entries, mount_root)
            .cloned()
            .ok_or_else(|| SnapshotError::MountEntryNotFound(mount_root.to_path_buf()))
    }

    fn umount(&self, target: &Path) -> Result<()> {
        let target_str = target.to_string_lossy();
        info!(target = %target_str, "Unmounting");

        // umount2() leaves stale mtab entries behind, so use the binary
        run_checked(self.runner.as_ref(), "umount", &[&target_str]).map(|_| ())
    }

    fn mkdir_p(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`BrickDaemon`] that reads pid files and signals processes with `kill`.
pub struct HostDaemon {
    runner: Arc<dyn CommandRunner>,
}

impl HostDaemon {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl BrickDaemon for HostDaemon {
    fn running_pid(&self, pidfile: &Path) -> Option<u32> {
        let contents = fs::read_to_string(pidfile).ok()?;
        let pid = contents.trim().parse::<u32>().ok()?;
        Path::new("/proc").join(pid.to_string()).exists().then_some(pid)
    }

    fn terminate(&self, brick: &BrickRecord, pid: u32) -> Result<()> {
        info!(brick = %brick.identity(), pid, "Terminating brick process");

        let pid_str = pid.to_string();
        run_checked(self.runner.as_ref(), "kill", &["-TERM", &pid_str])
            .map(|_| ())
            .inspect_err(|e| {
                error!(brick = %brick.identity(), pid, error = %e, "Failed to terminate brick process");
            })
    }
}

/// Remove a brick's now-empty runtime directory.
///
/// A directory that is already gone, or still populated by another daemon
/// instance, is not an error.
pub fn cleanup_brick_dir(mounts: &dyn MountOps, dir: &Path) -> Result<()> {
    match mounts.remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(SnapshotError::Io(e))
            if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) =>
        {
            debug!(dir = %dir.display(), error = %e, "Brick directory left in place");
            Ok(())
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to remove brick directory");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRunner;

    #[test]
    fn test_host_mounts_mount_entry() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("mounts");
        fs::write(
            &table,
            "/dev/sdb1 /bricks/b2 btrfs rw,relatime 0 0\ntank/b3 /bricks/b3 zfs rw 0 0\n",
        )
        .unwrap();

        let mounts = HostMounts::new(Arc::new(FakeRunner::new()), &table);
        let entry = mounts.mount_entry(Path::new("/bricks/b3")).unwrap();
        assert_eq!(entry.fsname, "tank/b3");
        assert_eq!(entry.fstype, "zfs");

        let err = mounts.mount_entry(Path::new("/bricks/b9")).unwrap_err();
        assert!(matches!(err, SnapshotError::MountEntryNotFound(_)));
    }

    #[test]
    fn test_host_mounts_umount_uses_command() {
        let runner = Arc::new(FakeRunner::new());
        let mounts = HostMounts::new(runner.clone(), PROC_MOUNTS);
        mounts.umount(Path::new("/run/gluster/snaps/x/brick1")).unwrap();
        assert_eq!(
            runner.calls(),
            vec![vec!["umount".to_string(), "/run/gluster/snaps/x/brick1".to_string()]]
        );
    }

    #[test]
    fn test_cleanup_brick_dir_tolerates_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let brick_dir = dir.path().join("brick1");
        fs::create_dir_all(brick_dir.join("still-here")).unwrap();

        let mounts = HostMounts::new(Arc::new(FakeRunner::new()), PROC_MOUNTS);
        cleanup_brick_dir(&mounts, &brick_dir).unwrap();
        assert!(brick_dir.exists());

        fs::remove_dir(brick_dir.join("still-here")).unwrap();
        cleanup_brick_dir(&mounts, &brick_dir).unwrap();
        assert!(!brick_dir.exists());

        // Already gone
        cleanup_brick_dir(&mounts, &brick_dir).unwrap();
    }

    #[test]
    fn test_host_daemon_running_pid() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = HostDaemon::new(Arc::new(FakeRunner::new()));

        let missing = dir.path().join("missing.pid");
        assert_eq!(daemon.running_pid(&missing), None);

        let garbage = dir.path().join("garbage.pid");
        fs::write(&garbage, "not-a-pid").unwrap();
        assert_eq!(daemon.running_pid(&garbage), None);

        let me = dir.path().join("me.pid");
        fs::write(&me, format!("{}\n", std::process::id())).unwrap();
        if Path::new("/proc/self").exists() {
            assert_eq!(daemon.running_pid(&me), Some(std::process::id()));
        }
    }
}
