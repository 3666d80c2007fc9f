//! Per-call context handed to every backend operation.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::brick::BrickRecord;
use crate::exec::{CommandRunner, HostRunner};
#[cfg(any(test, feature = "testing"))]
use crate::fakes::{FakeDaemon, FakeMounts, FakeRunner};
use crate::host::{BrickDaemon, HostDaemon, HostMounts, MountOps, PROC_MOUNTS};

/// Default runtime directory for private mounts and pid files.
pub const DEFAULT_RUN_DIR: &str = "/run/gluster";

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, three seconds apart. One second was not enough to
    /// outlast brick daemons still releasing the mount.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(3))
    }
}

#[derive(Debug, Clone)]
pub struct SnapConfig {
    /// Root for private mount points and brick pid files
    pub run_dir: PathBuf,
    /// Mount table consulted by the host mount helper
    pub mount_table: PathBuf,
    /// Unmount retry policy used while removing snapshots
    pub umount_retry: RetryPolicy,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            mount_table: PathBuf::from(PROC_MOUNTS),
            umount_retry: RetryPolicy::default(),
        }
    }
}

impl SnapConfig {
    /// Private mount point used to manage a Btrfs subvolume.
    pub fn btrfs_mount_dir(&self, subvol: &str) -> PathBuf {
        self.run_dir.join("btrfs").join(subvol)
    }

    /// Pid file of the brick process serving `brick` in `volname`.
    pub fn brick_pidfile(&self, volname: &str, brick: &BrickRecord) -> PathBuf {
        self.run_dir
            .join("vols")
            .join(volname)
            .join(format!("{}-{}.pid", brick.hostname, brick.dashed_path()))
    }
}

/// Identity of the node running the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub hostname: String,
    pub uuid: Option<Uuid>,
}

impl NodeIdentity {
    pub fn new(hostname: impl Into<String>, uuid: Option<Uuid>) -> Self {
        Self {
            hostname: hostname.into(),
            uuid,
        }
    }

    /// Identity of the local host.
    pub fn local(uuid: Option<Uuid>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self::new(hostname, uuid)
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uuid {
            Some(uuid) => write!(f, "{}({})", self.hostname, uuid),
            None => write!(f, "{}", self.hostname),
        }
    }
}

/// Collaborators and settings for backend operations.
#[derive(Clone)]
pub struct SnapContext {
    pub runner: Arc<dyn CommandRunner>,
    pub mounts: Arc<dyn MountOps>,
    pub daemon: Arc<dyn BrickDaemon>,
    pub node: NodeIdentity,
    pub config: SnapConfig,
}

impl SnapContext {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        mounts: Arc<dyn MountOps>,
        daemon: Arc<dyn BrickDaemon>,
        node: NodeIdentity,
        config: SnapConfig,
    ) -> Self {
        Self {
            runner,
            mounts,
            daemon,
            node,
            config,
        }
    }

    /// Context wired to the local host.
    pub fn host(node: NodeIdentity, config: SnapConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
        let mounts = Arc::new(HostMounts::new(runner.clone(), config.mount_table.clone()));
        let daemon = Arc::new(HostDaemon::new(runner.clone()));
        Self::new(runner, mounts, daemon, node, config)
    }

    /// Context wired to fakes with a zero-delay retry policy.
    #[cfg(any(test, feature = "testing"))]
    pub fn fake(runner: Arc<FakeRunner>, mounts: Arc<FakeMounts>, daemon: Arc<FakeDaemon>) -> Self {
        let config = SnapConfig {
            umount_retry: RetryPolicy::new(3, Duration::ZERO),
            ..SnapConfig::default()
        };
        Self::new(
            runner,
            mounts,
            daemon,
            NodeIdentity::new("node1", None),
            config,
        )
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn mounts(&self) -> &dyn MountOps {
        self.mounts.as_ref()
    }

    /// Pause between unmount attempts.
    pub fn retry_pause(&self) {
        let delay = self.config.umount_retry.delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    pub fn btrfs_mount_dir(&self, subvol: &str) -> PathBuf {
        self.config.btrfs_mount_dir(subvol)
    }

    pub fn run_dir(&self) -> &Path {
        &self.config.run_dir
    }
}
