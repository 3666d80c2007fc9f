//! Snapshot backends.
//!
//! Every storage technology implements [`SnapshotBackend`]. Callers pick a
//! backend once per brick with [`select_backend`] and then drive it through
//! `device` → `create` → (commit) for creation, `remove` for deletion and
//! `missed` for replays.
//!
//! ```text
//!                    select_backend(forced, brick_path)
//!                                  │
//!        ┌──────────────┬──────────┴───┬───────────────┐
//!        ▼              ▼              ▼               ▼
//!   ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌─────────────┐
//!   │   LVM   │   │  Btrfs   │   │   ZFS   │   │ Unsupported │
//!   └─────────┘   └──────────┘   └─────────┘   └─────────────┘
//! ```

pub mod btrfs;
pub mod lvm;
pub mod parse;
pub mod zfs;

use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::brick::{BrickRecord, BrickStatus, MissedSnapOp, ResponseMap, SnapVolume};
use crate::context::SnapContext;
use crate::error::{Result, SnapshotError};
use crate::exec::run_checked;
use crate::metrics;

pub use btrfs::BtrfsBackend;
pub use lvm::LvmBackend;
pub use zfs::ZfsBackend;

/// Storage technologies with native snapshot support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Lvm,
    Btrfs,
    Zfs,
}

impl BackendKind {
    /// Probe order used when no backend is forced.
    pub const ALL: [BackendKind; 3] = [BackendKind::Lvm, BackendKind::Btrfs, BackendKind::Zfs];

    pub fn backend(self) -> &'static dyn SnapshotBackend {
        match self {
            BackendKind::Lvm => &LVM,
            BackendKind::Btrfs => &BTRFS,
            BackendKind::Zfs => &ZFS,
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Lvm => write!(f, "lvm"),
            BackendKind::Btrfs => write!(f, "btrfs"),
            BackendKind::Zfs => write!(f, "zfs"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lvm" => Ok(BackendKind::Lvm),
            "btrfs" => Ok(BackendKind::Btrfs),
            "zfs" => Ok(BackendKind::Zfs),
            _ => Err(SnapshotError::UnknownBackend(s.to_string())),
        }
    }
}

/// How a removal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The native snapshot resource was destroyed
    Removed,
    /// The mount could not be released; the native resource was left in place
    Degraded,
}

/// The operations every snapshot backend provides.
///
/// Failures are logged by the backend before the error is returned, so
/// callers only decide whether to retry or record a missed operation.
pub trait SnapshotBackend: Send + Sync {
    /// Backend name as persisted in volume options.
    fn name(&self) -> &'static str;

    /// Whether the filesystem holding `brick_path` is managed by this backend.
    fn probe(&self, ctx: &SnapContext, brick_path: &Path) -> bool;

    /// Write capacity figures for `brick` into `rsp` under `key_prefix`.
    fn details(
        &self,
        ctx: &SnapContext,
        rsp: &mut ResponseMap,
        brick: &BrickRecord,
        volname: &str,
        device: &str,
        key_prefix: &str,
    ) -> Result<()>;

    /// Identifier of the snapshot of `origin` named after `snapname` and the
    /// brick position. Never mutates brick state.
    fn device(
        &self,
        ctx: &SnapContext,
        origin: &str,
        snapname: &str,
        brick_index: u32,
    ) -> Result<String>;

    /// Take the snapshot recorded in `brick.device_path` from the brick at
    /// `origin_brick_path`.
    fn create(
        &self,
        ctx: &SnapContext,
        brick: &mut BrickRecord,
        origin_brick_path: &Path,
    ) -> Result<()>;

    /// Replay an operation the brick missed while its node was unreachable.
    fn missed(
        &self,
        ctx: &SnapContext,
        volname: &str,
        snapname: &str,
        brick: &mut BrickRecord,
        op: &MissedSnapOp,
    ) -> Result<()>;

    /// Stop, unmount and destroy the snapshot backing `brick`.
    fn remove(
        &self,
        ctx: &SnapContext,
        snap_vol: &SnapVolume,
        brick: &mut BrickRecord,
        mount_pt: &Path,
        snap_device: &str,
    ) -> Result<RemoveOutcome>;

    /// Mount the snapshot backing `brick` at `target`.
    fn mount(&self, ctx: &SnapContext, brick: &BrickRecord, target: &Path) -> Result<()>;
}

static LVM: LvmBackend = LvmBackend;
static BTRFS: BtrfsBackend = BtrfsBackend;
static ZFS: ZfsBackend = ZfsBackend;
static UNSUPPORTED: UnsupportedBackend = UnsupportedBackend;

/// Fallback for bricks no backend claims.
pub fn unsupported() -> &'static dyn SnapshotBackend {
    &UNSUPPORTED
}

/// First backend whose probe accepts `brick_path`.
pub fn probe_backend(ctx: &SnapContext, brick_path: &Path) -> Option<BackendKind> {
    BackendKind::ALL
        .into_iter()
        .find(|kind| kind.backend().probe(ctx, brick_path))
}

/// Pick the backend for a brick.
///
/// A forced backend name wins; otherwise the brick is probed, falling back
/// to the unsupported backend.
pub fn select_backend(
    ctx: &SnapContext,
    forced: Option<&str>,
    brick_path: &Path,
) -> Result<&'static dyn SnapshotBackend> {
    if let Some(name) = forced {
        let kind = name.parse::<BackendKind>().inspect_err(|e| {
            error!(backend = %name, error = %e, "Invalid forced snapshot backend");
        })?;
        debug!(backend = %kind, brick = %brick_path.display(), "Using forced snapshot backend");
        return Ok(kind.backend());
    }

    match probe_backend(ctx, brick_path) {
        Some(kind) => {
            info!(backend = %kind, brick = %brick_path.display(), "Selected snapshot backend");
            Ok(kind.backend())
        }
        None => {
            warn!(brick = %brick_path.display(), "No snapshot backend supports brick");
            Ok(unsupported())
        }
    }
}

/// Validate that a snapshot name is safe to embed in device names and
/// command arguments.
pub(crate) fn validate_snapname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SnapshotError::InvalidName("name cannot be empty".into()));
    }
    if name.contains("..") {
        return Err(SnapshotError::InvalidName("path traversal not allowed".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(SnapshotError::InvalidName(format!(
            "invalid characters in name '{}': only alphanumeric, underscore, hyphen, and period allowed",
            name
        )));
    }
    Ok(())
}

/// Whether the filesystem holding `brick_path` is mounted with type `fstype`.
pub(crate) fn probe_fstype(
    ctx: &SnapContext,
    backend: &str,
    brick_path: &Path,
    fstype: &str,
) -> bool {
    let entry = ctx
        .mounts()
        .brick_root(brick_path)
        .and_then(|root| ctx.mounts().mount_entry(&root));

    match entry {
        Ok(entry) => entry.fstype == fstype,
        Err(e) => {
            warn!(backend, brick = %brick_path.display(), error = %e, "Failed to resolve brick mount");
            false
        }
    }
}

/// Mount options for a snapshot of a `fstype` filesystem.
///
/// XFS refuses to mount a second filesystem with the same UUID, which a
/// snapshot always has, so `nouuid` is added for XFS when missing.
pub fn snapshot_mount_options(opts: &str, fstype: &str) -> String {
    let opts = opts.trim();
    if fstype != "xfs" || parse::has_mount_option(opts, "nouuid") {
        return opts.to_string();
    }
    if opts.is_empty() {
        "nouuid".to_string()
    } else {
        format!("{},nouuid", opts)
    }
}

/// Mount `device` at `target` with `mount [-o <opts>] <device> <target>`.
pub(crate) fn mount_snapshot(
    ctx: &SnapContext,
    backend: &str,
    device: &str,
    opts: &str,
    fstype: &str,
    target: &Path,
) -> Result<()> {
    let opts = snapshot_mount_options(opts, fstype);
    let target_str = target.to_string_lossy();

    let mut args: Vec<&str> = Vec::with_capacity(4);
    if !opts.is_empty() {
        args.extend(["-o", &*opts]);
    }
    args.extend([device, &*target_str]);

    debug!(backend, device, target = %target_str, opts = %opts, "Mounting snapshot");
    run_checked(ctx.runner(), "mount", &args)
        .map(|_| ())
        .inspect_err(|e| {
            error!(backend, device, target = %target_str, error = %e, "Failed to mount snapshot");
        })
}

/// Mount a brick's own snapshot device with its recorded options.
pub(crate) fn mount_brick(
    ctx: &SnapContext,
    backend: &str,
    brick: &BrickRecord,
    target: &Path,
) -> Result<()> {
    mount_snapshot(
        ctx,
        backend,
        &brick.device_path,
        &brick.mnt_opts,
        &brick.fstype,
        target,
    )
}

/// Result of releasing a brick's mount before destroying its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    Unmounted,
    /// Nothing mounted where expected; go straight to destroy
    AlreadyDetached,
    /// Unmount retries exhausted
    UnmountFailed,
}

/// Stop the brick process if it runs, then unmount `mount_pt` with retries.
pub(crate) fn stop_and_unmount(
    ctx: &SnapContext,
    backend: &str,
    snap_vol: &SnapVolume,
    brick: &mut BrickRecord,
    mount_pt: &Path,
) -> Teardown {
    let pidfile = ctx.config.brick_pidfile(&snap_vol.volname, brick);
    if let Some(pid) = ctx.daemon.running_pid(&pidfile) {
        if let Err(e) = ctx.daemon.terminate(brick, pid) {
            warn!(backend, brick = %brick.identity(), pid, error = %e, "Brick termination request failed");
        }
        brick.status = BrickStatus::Stopped;
    }

    let root = match ctx.mounts().brick_root(&brick.path) {
        Ok(root) => root,
        Err(e) => {
            warn!(
                backend,
                volume = %snap_vol.volname,
                snapshot = %snap_vol.snapname,
                brick = %brick.identity(),
                error = %e,
                "Brick root not found, skipping unmount"
            );
            return Teardown::AlreadyDetached;
        }
    };
    if root != mount_pt {
        warn!(
            backend,
            brick = %brick.identity(),
            mount_root = %root.display(),
            expected = %mount_pt.display(),
            "Snapshot is not mounted for brick, skipping unmount"
        );
        return Teardown::AlreadyDetached;
    }

    // The brick daemon may still hold the mount while shutting down
    let policy = ctx.config.umount_retry;
    for attempt in 1..=policy.attempts {
        match ctx.mounts().umount(mount_pt) {
            Ok(()) => return Teardown::Unmounted,
            Err(e) => {
                debug!(
                    backend,
                    path = %mount_pt.display(),
                    brick = %brick.identity(),
                    attempt,
                    error = %e,
                    "umount failed, retrying"
                );
                metrics::record_unmount_retry(backend);
                if attempt < policy.attempts {
                    ctx.retry_pause();
                }
            }
        }
    }

    error!(
        backend,
        path = %mount_pt.display(),
        brick = %brick.identity(),
        attempts = policy.attempts,
        "umount failed, leaving snapshot in place"
    );
    Teardown::UnmountFailed
}

/// Re-drive a missed delete: the mount point is the brick's current mount
/// root and the snapshot is the identifier recorded on the brick.
pub(crate) fn replay_missed_delete(
    backend: &dyn SnapshotBackend,
    ctx: &SnapContext,
    volname: &str,
    snapname: &str,
    brick: &mut BrickRecord,
) -> Result<()> {
    let mount_pt = ctx
        .mounts()
        .brick_root(&brick.path)
        .ok()
        .or_else(|| brick.path.parent().map(Path::to_path_buf))
        .ok_or_else(|| SnapshotError::BrickRoot(brick.path.clone()))?;
    let snap_device = brick.device_path.clone();
    let snap_vol = SnapVolume::named(volname, snapname, brick.volume_id);

    backend
        .remove(ctx, &snap_vol, brick, &mount_pt, &snap_device)
        .map(|_| ())
}

/// Backend used when no storage technology claims a brick.
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    fn decline<T>(&self, operation: &'static str, subject: &str) -> Result<T> {
        error!(subject, operation, "No snapshot backend available");
        Err(SnapshotError::Unsupported {
            backend: self.name(),
            operation,
        })
    }
}

impl SnapshotBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn probe(&self, _ctx: &SnapContext, _brick_path: &Path) -> bool {
        false
    }

    fn details(
        &self,
        _ctx: &SnapContext,
        _rsp: &mut ResponseMap,
        brick: &BrickRecord,
        _volname: &str,
        _device: &str,
        _key_prefix: &str,
    ) -> Result<()> {
        self.decline("details", &brick.identity())
    }

    fn device(
        &self,
        _ctx: &SnapContext,
        origin: &str,
        _snapname: &str,
        _brick_index: u32,
    ) -> Result<String> {
        self.decline("device", origin)
    }

    fn create(
        &self,
        _ctx: &SnapContext,
        brick: &mut BrickRecord,
        _origin_brick_path: &Path,
    ) -> Result<()> {
        self.decline("create", &brick.identity())
    }

    fn missed(
        &self,
        _ctx: &SnapContext,
        _volname: &str,
        _snapname: &str,
        brick: &mut BrickRecord,
        _op: &MissedSnapOp,
    ) -> Result<()> {
        self.decline("missed", &brick.identity())
    }

    fn remove(
        &self,
        _ctx: &SnapContext,
        _snap_vol: &SnapVolume,
        brick: &mut BrickRecord,
        _mount_pt: &Path,
        _snap_device: &str,
    ) -> Result<RemoveOutcome> {
        self.decline("remove", &brick.identity())
    }

    fn mount(&self, _ctx: &SnapContext, brick: &BrickRecord, _target: &Path) -> Result<()> {
        self.decline("mount", &brick.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::fakes::{FakeDaemon, FakeMounts, FakeRunner};

    fn fixture() -> (Arc<FakeRunner>, Arc<FakeMounts>, Arc<FakeDaemon>, SnapContext) {
        let runner = Arc::new(FakeRunner::new());
        let mounts = Arc::new(FakeMounts::new());
        let daemon = Arc::new(FakeDaemon::new());
        let ctx = SnapContext::fake(runner.clone(), mounts.clone(), daemon.clone());
        (runner, mounts, daemon, ctx)
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn snap_volume() -> SnapVolume {
        SnapVolume::named("snapvol", "snap1", Uuid::nil())
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("lvm".parse::<BackendKind>().unwrap(), BackendKind::Lvm);
        assert_eq!("BTRFS".parse::<BackendKind>().unwrap(), BackendKind::Btrfs);
        assert_eq!(" zfs ".parse::<BackendKind>().unwrap(), BackendKind::Zfs);
        assert!(matches!(
            "ext4".parse::<BackendKind>(),
            Err(SnapshotError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_backend_kind_names_match_backends() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.backend().name(), kind.to_string());
        }
    }

    #[test]
    fn test_validate_snapname() {
        assert!(validate_snapname("snap1").is_ok());
        assert!(validate_snapname("snap-1_a.b").is_ok());
        assert!(validate_snapname("").is_err());
        assert!(validate_snapname("..").is_err());
        assert!(validate_snapname("snap/1").is_err());
        assert!(validate_snapname("snap@1").is_err());
        assert!(validate_snapname("$(id)").is_err());
    }

    #[test]
    fn test_snapshot_mount_options() {
        assert_eq!(snapshot_mount_options("", "xfs"), "nouuid");
        assert_eq!(snapshot_mount_options("rw", "xfs"), "rw,nouuid");
        assert_eq!(snapshot_mount_options("rw,nouuid", "xfs"), "rw,nouuid");
        assert_eq!(snapshot_mount_options("rw", "ext4"), "rw");
        assert_eq!(snapshot_mount_options("", "ext4"), "");
    }

    #[test]
    fn test_mount_snapshot_command_shape() {
        let (runner, _, _, ctx) = fixture();
        mount_snapshot(&ctx, "lvm", "/dev/vg0/snap1_0", "", "xfs", Path::new("/mnt/b1")).unwrap();
        mount_snapshot(&ctx, "lvm", "/dev/vg0/snap1_1", "", "ext4", Path::new("/mnt/b2")).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "mount -o nouuid /dev/vg0/snap1_0 /mnt/b1",
                "mount /dev/vg0/snap1_1 /mnt/b2",
            ]
        );
    }

    #[test]
    fn test_mount_snapshot_failure() {
        let (runner, _, _, ctx) = fixture();
        runner.fail_when("mount", 32, "wrong fs type");
        let err =
            mount_snapshot(&ctx, "lvm", "/dev/vg0/snap1_0", "", "xfs", Path::new("/mnt/b1"))
                .unwrap_err();
        assert!(err.to_string().contains("wrong fs type"));
    }

    #[test]
    fn test_select_backend_forced() {
        let (runner, _, _, ctx) = fixture();
        let backend = select_backend(&ctx, Some("zfs"), Path::new("/bricks/b1")).unwrap();
        assert_eq!(backend.name(), "zfs");
        assert!(runner.calls().is_empty());

        assert!(select_backend(&ctx, Some("ceph"), Path::new("/bricks/b1")).is_err());
    }

    #[test]
    fn test_select_backend_probes() {
        let (runner, mounts, _, ctx) = fixture();
        mounts.add_mount("/dev/sdb1", "/bricks/b2", "btrfs");
        // sdb1 is not a logical volume
        runner.fail_when("lvs", 5, "Failed to find logical volume");

        let backend = select_backend(&ctx, None, Path::new("/bricks/b2")).unwrap();
        assert_eq!(backend.name(), "btrfs");
    }

    #[test]
    fn test_select_backend_falls_back_to_unsupported() {
        let (runner, mounts, _, ctx) = fixture();
        mounts.add_mount("/dev/sdc1", "/bricks/b4", "ext4");
        runner.fail_when("lvs", 5, "Failed to find logical volume");

        let backend = select_backend(&ctx, None, Path::new("/bricks/b4")).unwrap();
        assert_eq!(backend.name(), "none");

        let mut brick = BrickRecord::new("node1", "/bricks/b4", Uuid::nil());
        assert!(matches!(
            backend.create(&ctx, &mut brick, Path::new("/bricks/b4")),
            Err(SnapshotError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_stop_and_unmount_terminates_running_brick() {
        let (_, mounts, daemon, ctx) = fixture();
        mounts.add_mount("/dev/vg0/snap1_0", "/run/gluster/snaps/snapvol/brick1", "xfs");
        let mut brick =
            BrickRecord::new("node1", "/run/gluster/snaps/snapvol/brick1/b1", Uuid::nil());
        brick.status = BrickStatus::Started;
        daemon.set_running(ctx.config.brick_pidfile("snapvol", &brick), 4242);

        let result = stop_and_unmount(
            &ctx,
            "lvm",
            &snap_volume(),
            &mut brick,
            Path::new("/run/gluster/snaps/snapvol/brick1"),
        );

        assert_eq!(result, Teardown::Unmounted);
        assert_eq!(brick.status, BrickStatus::Stopped);
        assert_eq!(daemon.terminated().len(), 1);
        assert_eq!(daemon.terminated()[0].1, 4242);
    }

    #[test]
    fn test_stop_and_unmount_skips_when_not_mounted() {
        let (_, mounts, _, ctx) = fixture();
        let mut brick =
            BrickRecord::new("node1", "/run/gluster/snaps/snapvol/brick1/b1", Uuid::nil());

        // No mount at all
        let result = stop_and_unmount(
            &ctx,
            "lvm",
            &snap_volume(),
            &mut brick,
            Path::new("/run/gluster/snaps/snapvol/brick1"),
        );
        assert_eq!(result, Teardown::AlreadyDetached);

        // Mounted somewhere else
        mounts.add_mount("/dev/sda1", "/", "ext4");
        let result = stop_and_unmount(
            &ctx,
            "lvm",
            &snap_volume(),
            &mut brick,
            Path::new("/run/gluster/snaps/snapvol/brick1"),
        );
        assert_eq!(result, Teardown::AlreadyDetached);
        assert!(mounts.umounts().is_empty());
    }

    #[test]
    fn test_stop_and_unmount_retry_bound() {
        let (_, mounts, _, ctx) = fixture();
        let mount_pt = PathBuf::from("/run/gluster/snaps/snapvol/brick1");
        mounts.add_mount("/dev/vg0/snap1_0", &mount_pt, "xfs");
        mounts.fail_umounts(u32::MAX);
        let mut brick =
            BrickRecord::new("node1", "/run/gluster/snaps/snapvol/brick1/b1", Uuid::nil());

        let result = stop_and_unmount(&ctx, "lvm", &snap_volume(), &mut brick, &mount_pt);
        assert_eq!(result, Teardown::UnmountFailed);
        assert_eq!(mounts.umounts().len(), 3);
    }

    #[test]
    fn test_stop_and_unmount_recovers_on_retry() {
        let (_, mounts, _, ctx) = fixture();
        let mount_pt = PathBuf::from("/run/gluster/snaps/snapvol/brick1");
        mounts.add_mount("/dev/vg0/snap1_0", &mount_pt, "xfs");
        mounts.fail_umounts(2);
        let mut brick =
            BrickRecord::new("node1", "/run/gluster/snaps/snapvol/brick1/b1", Uuid::nil());

        let result = stop_and_unmount(&ctx, "lvm", &snap_volume(), &mut brick, &mount_pt);
        assert_eq!(result, Teardown::Unmounted);
        assert_eq!(mounts.umounts().len(), 3);
    }

    #[test]
    fn test_probe_unresolved_mount_logs_warning() {
        let (_, _, _, ctx) = fixture();
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(logs.clone())
            .finish();

        let claimed = tracing::subscriber::with_default(subscriber, || {
            probe_fstype(&ctx, "btrfs", Path::new("/unmounted"), "btrfs")
        });

        assert!(!claimed);
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Failed to resolve brick mount"));
    }
}
