//! LVM thin-provisioned snapshots.
//!
//! Snapshots are block devices named `/dev/<vg>/<snapname>_<index>`, created
//! with `lvcreate -s` and destroyed with `lvremove -f`.

use std::path::Path;

use tracing::{debug, error, info, instrument, warn};

use super::parse::{self, LvsDetails};
use super::{
    RemoveOutcome, SnapshotBackend, Teardown, mount_brick, replay_missed_delete, stop_and_unmount,
    validate_snapname,
};
use crate::brick::{BrickRecord, MissedSnapOp, ResponseMap, SnapOpKind, SnapVolume, response_key};
use crate::context::SnapContext;
use crate::error::{Result, SnapshotError};
use crate::exec::run_checked;
use crate::host::cleanup_brick_dir;

pub const LVS: &str = "lvs";
pub const LVCREATE: &str = "lvcreate";
pub const LVREMOVE: &str = "lvremove";

const ACTIVATION_SKIP_FLAG: &str = "setactivationskip";

/// Whether `lvremove` failed because the volume no longer exists.
fn lv_missing(stderr: &str) -> bool {
    stderr.contains("Failed to find logical volume") || stderr.contains("not found")
}

/// Backend for bricks on thinly provisioned logical volumes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LvmBackend;

impl LvmBackend {
    const NAME: &'static str = "lvm";

    /// Thin pool backing the brick at `brick_path`.
    ///
    /// Returns [`SnapshotError::NotThinProvisioned`] for a regular LV so
    /// callers can tell it apart from a lookup failure.
    pub fn thin_pool(&self, ctx: &SnapContext, brick_path: &Path) -> Result<String> {
        let device = ctx.mounts().brick_mount_device(brick_path).inspect_err(|e| {
            error!(backend = Self::NAME, brick = %brick_path.display(), error = %e, "Failed to get the device of the brick");
        })?;

        if !ctx.runner().is_available(LVS) {
            error!(backend = Self::NAME, tool = LVS, "LVM commands not found");
            return Err(SnapshotError::ToolUnavailable(LVS.to_string()));
        }

        let output = run_checked(ctx.runner(), LVS, &["--noheadings", "-o", "pool_lv", &device])
            .inspect_err(|e| {
                error!(backend = Self::NAME, device = %device, error = %e, "Failed to get thin pool name");
            })?;

        parse::thin_pool(&output.stdout).ok_or_else(|| {
            debug!(backend = Self::NAME, device = %device, "Logical volume is not thinly provisioned");
            SnapshotError::NotThinProvisioned(device)
        })
    }

    /// Whether the installed `lvcreate` understands `--setactivationskip`.
    ///
    /// Older releases print the flag in `--help` only when supported; some
    /// print usage on stderr, so both streams are scanned.
    fn supports_activation_skip(&self, ctx: &SnapContext) -> Result<bool> {
        let help = ctx.runner().run(LVCREATE, &["--help"]).inspect_err(|e| {
            error!(backend = Self::NAME, error = %e, "Failed to run lvcreate help");
        })?;
        Ok(parse::help_mentions(&help.stdout, ACTIVATION_SKIP_FLAG)
            || parse::help_mentions(&help.stderr, ACTIVATION_SKIP_FLAG))
    }
}

impl SnapshotBackend for LvmBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn probe(&self, ctx: &SnapContext, brick_path: &Path) -> bool {
        match self.thin_pool(ctx, brick_path) {
            Ok(pool) => {
                debug!(backend = Self::NAME, brick = %brick_path.display(), pool = %pool, "Brick is on a thin pool");
                true
            }
            Err(SnapshotError::NotThinProvisioned(device)) => {
                debug!(backend = Self::NAME, device = %device, "Not a thinly provisioned brick");
                false
            }
            Err(_) => false,
        }
    }

    #[instrument(skip(self, ctx, rsp, brick), fields(backend = "lvm", brick = %brick.identity()))]
    fn details(
        &self,
        ctx: &SnapContext,
        rsp: &mut ResponseMap,
        brick: &BrickRecord,
        volname: &str,
        device: &str,
        key_prefix: &str,
    ) -> Result<()> {
        let device = match ctx.mounts().brick_mount_device(&brick.path) {
            Ok(mounted) => mounted,
            Err(_) if !device.is_empty() => device.to_string(),
            Err(e) => {
                error!(volume = %volname, error = %e, "Failed to get the device of the brick");
                return Err(e);
            }
        };

        let output = run_checked(
            ctx.runner(),
            LVS,
            &[
                &device,
                "--noheadings",
                "-o",
                "vg_name,data_percent,lv_size",
                "--separator",
                ":",
            ],
        )
        .inspect_err(|e| {
            error!(volume = %volname, device = %device, error = %e, "Failed to get brick details");
        })?;

        for line in output.stdout.lines().filter(|line| !line.trim().is_empty()) {
            let details = LvsDetails::parse(line);
            if let Some(vg_name) = details.vg_name {
                rsp.insert(response_key(key_prefix, "vgname"), vg_name);
            }
            if let Some(data_percent) = details.data_percent {
                rsp.insert(response_key(key_prefix, "data"), data_percent);
            }
            if let Some(lv_size) = details.lv_size {
                rsp.insert(response_key(key_prefix, "lvsize"), lv_size);
            }
        }
        Ok(())
    }

    fn device(
        &self,
        ctx: &SnapContext,
        origin: &str,
        snapname: &str,
        brick_index: u32,
    ) -> Result<String> {
        validate_snapname(snapname)?;
        if origin.is_empty() {
            return Err(SnapshotError::InvalidDevice(origin.to_string()));
        }

        let output = run_checked(ctx.runner(), LVS, &["--noheadings", "-o", "vg_name", origin])
            .inspect_err(|e| {
                error!(backend = Self::NAME, device = %origin, error = %e, "Failed to get volume group");
            })?;
        let vg = parse::volume_group(&output.stdout)?;

        Ok(format!("/dev/{}/{}_{}", vg, snapname, brick_index))
    }

    #[instrument(skip(self, ctx, brick), fields(backend = "lvm", brick = %brick.identity()))]
    fn create(
        &self,
        ctx: &SnapContext,
        brick: &mut BrickRecord,
        origin_brick_path: &Path,
    ) -> Result<()> {
        if brick.device_path.is_empty() {
            error!("No snapshot device recorded on brick");
            return Err(SnapshotError::InvalidDevice(brick.device_path.clone()));
        }

        let origin_device = ctx
            .mounts()
            .brick_mount_device(origin_brick_path)
            .inspect_err(|e| {
                error!(origin = %origin_brick_path.display(), error = %e, "Failed to get the device of the origin brick");
            })?;

        let activation_skip = self.supports_activation_skip(ctx)?;

        let mut args = vec!["-s", origin_device.as_str()];
        if activation_skip {
            args.extend(["--setactivationskip", "n"]);
        }
        args.extend(["--name", brick.device_path.as_str()]);

        info!(origin = %origin_device, device = %brick.device_path, "Taking LVM snapshot");
        run_checked(ctx.runner(), LVCREATE, &args).inspect_err(|e| {
            error!(
                origin = %origin_device,
                device = %brick.device_path,
                error = %e,
                "Taking snapshot of the brick failed"
            );
        })?;

        info!(device = %brick.device_path, "LVM snapshot created successfully");
        Ok(())
    }

    #[instrument(skip(self, ctx, brick, op), fields(backend = "lvm", brick = %brick.identity(), op = %op.op))]
    fn missed(
        &self,
        ctx: &SnapContext,
        volname: &str,
        snapname: &str,
        brick: &mut BrickRecord,
        op: &MissedSnapOp,
    ) -> Result<()> {
        match op.op {
            SnapOpKind::Create => {
                let origin_device = ctx.mounts().brick_mount_device(&op.brick_path).inspect_err(|e| {
                    error!(origin = %op.brick_path.display(), error = %e, "Failed to get the device of the origin brick");
                })?;
                let device = self.device(ctx, &origin_device, volname, op.brick_index()?)?;
                brick.device_path = device;
                self.create(ctx, brick, &op.brick_path)
            }
            SnapOpKind::Delete => replay_missed_delete(self, ctx, volname, snapname, brick),
        }
    }

    #[instrument(skip(self, ctx, snap_vol, brick), fields(backend = "lvm", volume = %snap_vol.volname, brick = %brick.identity()))]
    fn remove(
        &self,
        ctx: &SnapContext,
        snap_vol: &SnapVolume,
        brick: &mut BrickRecord,
        mount_pt: &Path,
        snap_device: &str,
    ) -> Result<RemoveOutcome> {
        if stop_and_unmount(ctx, Self::NAME, snap_vol, brick, mount_pt) == Teardown::UnmountFailed {
            warn!(device = %snap_device, "Snapshot left in place after failed unmount");
            return Ok(RemoveOutcome::Degraded);
        }

        match run_checked(ctx.runner(), LVREMOVE, &["-f", snap_device]) {
            Ok(_) => info!(device = %snap_device, "LVM snapshot removed"),
            Err(SnapshotError::CommandFailed { stderr, .. }) if lv_missing(&stderr) => {
                info!(device = %snap_device, "Snapshot already removed (idempotent)");
            }
            Err(e) => {
                error!(device = %snap_device, error = %e, "Failed to remove the snapshot");
                return Err(e);
            }
        }

        // Errors are logged by the helper; the snapshot itself is gone
        let _ = cleanup_brick_dir(ctx.mounts(), mount_pt);
        Ok(RemoveOutcome::Removed)
    }

    fn mount(&self, ctx: &SnapContext, brick: &BrickRecord, target: &Path) -> Result<()> {
        mount_brick(ctx, Self::NAME, brick, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::brick::BrickStatus;
    use crate::fakes::{FakeDaemon, FakeMounts, FakeRunner};

    const SNAP_MOUNT: &str = "/run/gluster/snaps/snapvol/brick1";

    fn fixture() -> (Arc<FakeRunner>, Arc<FakeMounts>, Arc<FakeDaemon>, SnapContext) {
        let runner = Arc::new(FakeRunner::new());
        let mounts = Arc::new(FakeMounts::new());
        let daemon = Arc::new(FakeDaemon::new());
        mounts.add_mount("/dev/vg0/brick1", "/bricks/b1", "xfs");
        let ctx = SnapContext::fake(runner.clone(), mounts.clone(), daemon.clone());
        (runner, mounts, daemon, ctx)
    }

    fn snap_brick() -> BrickRecord {
        let mut brick = BrickRecord::new("node1", format!("{}/b1", SNAP_MOUNT), Uuid::nil());
        brick.device_path = "/dev/vg0/snap1_0".into();
        brick.fstype = "xfs".into();
        brick
    }

    #[test]
    fn test_thin_pool() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvs --noheadings -o pool_lv /dev/vg0/brick1", "  pool0\n");
        assert_eq!(LvmBackend.thin_pool(&ctx, Path::new("/bricks/b1")).unwrap(), "pool0");
        assert!(LvmBackend.probe(&ctx, Path::new("/bricks/b1")));
        // Same answer on repeated probes
        assert!(LvmBackend.probe(&ctx, Path::new("/bricks/b1")));
    }

    #[test]
    fn test_thin_pool_thick_volume() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvs --noheadings -o pool_lv", "   \n");
        assert!(matches!(
            LvmBackend.thin_pool(&ctx, Path::new("/bricks/b1")),
            Err(SnapshotError::NotThinProvisioned(dev)) if dev == "/dev/vg0/brick1"
        ));
        assert!(!LvmBackend.probe(&ctx, Path::new("/bricks/b1")));
    }

    #[test]
    fn test_probe_failures() {
        let (runner, _, _, ctx) = fixture();
        // Unmounted path
        assert!(!LvmBackend.probe(&ctx, Path::new("/srv/b9")));

        runner.mark_missing(LVS);
        assert!(matches!(
            LvmBackend.thin_pool(&ctx, Path::new("/bricks/b1")),
            Err(SnapshotError::ToolUnavailable(_))
        ));
        assert!(!LvmBackend.probe(&ctx, Path::new("/bricks/b1")));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_device() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvs --noheadings -o vg_name /dev/vg0/brick1", "  vg0\n");

        let device = LvmBackend.device(&ctx, "/dev/vg0/brick1", "snap1", 0).unwrap();
        assert_eq!(device, "/dev/vg0/snap1_0");
        assert_eq!(
            LvmBackend.device(&ctx, "/dev/vg0/brick1", "snap1", 0).unwrap(),
            device
        );
        assert_ne!(
            LvmBackend.device(&ctx, "/dev/vg0/brick1", "snap1", 1).unwrap(),
            device
        );
    }

    #[test]
    fn test_device_rejects_empty_name_without_commands() {
        let (runner, _, _, ctx) = fixture();
        assert!(LvmBackend.device(&ctx, "/dev/vg0/brick1", "", 0).is_err());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_device_lookup_failure() {
        let (runner, _, _, ctx) = fixture();
        runner.fail_when("lvs", 5, "Failed to find logical volume");
        assert!(matches!(
            LvmBackend.device(&ctx, "/dev/vg0/brick1", "snap1", 0),
            Err(SnapshotError::CommandFailed { status: 5, .. })
        ));

        runner.respond("lvs", "\n");
        assert!(matches!(
            LvmBackend.device(&ctx, "/dev/vg0/brick1", "snap1", 0),
            Err(SnapshotError::ParseError { .. })
        ));
    }

    #[test]
    fn test_create_without_activation_skip() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvcreate --help", "  lvcreate\n\t[--name LV]\n");
        let mut brick = snap_brick();

        LvmBackend.create(&ctx, &mut brick, Path::new("/bricks/b1")).unwrap();
        assert_eq!(
            runner.command_lines().last().unwrap(),
            "lvcreate -s /dev/vg0/brick1 --name /dev/vg0/snap1_0"
        );
    }

    #[test]
    fn test_create_with_activation_skip() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvcreate --help", "\t[-k|--setactivationskip y|n]\n");
        let mut brick = snap_brick();

        LvmBackend.create(&ctx, &mut brick, Path::new("/bricks/b1")).unwrap();
        assert_eq!(
            runner.command_lines().last().unwrap(),
            "lvcreate -s /dev/vg0/brick1 --setactivationskip n --name /dev/vg0/snap1_0"
        );
    }

    #[test]
    fn test_create_failure() {
        let (runner, _, _, ctx) = fixture();
        runner.fail_when("lvcreate -s", 5, "Insufficient free space");
        let mut brick = snap_brick();

        let err = LvmBackend
            .create(&ctx, &mut brick, Path::new("/bricks/b1"))
            .unwrap_err();
        assert!(err.to_string().contains("Insufficient free space"));
        // No mount is attempted
        assert!(runner.calls_to("mount").is_empty());
    }

    #[test]
    fn test_create_unresolvable_origin() {
        let (runner, _, _, ctx) = fixture();
        let mut brick = snap_brick();
        assert!(LvmBackend.create(&ctx, &mut brick, Path::new("/srv/x")).is_err());
        assert!(runner.calls_to(LVCREATE).is_empty());
    }

    #[test]
    fn test_details() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvs /dev/vg0/brick1", "  vg0:42.5:10g\n");
        let brick = BrickRecord::new("node1", "/bricks/b1", Uuid::nil());

        let mut rsp = ResponseMap::new();
        LvmBackend
            .details(&ctx, &mut rsp, &brick, "vol0", "", "brick0")
            .unwrap();

        assert_eq!(rsp.get("brick0.vgname").map(String::as_str), Some("vg0"));
        assert_eq!(rsp.get("brick0.data").map(String::as_str), Some("42.5"));
        assert_eq!(rsp.get("brick0.lvsize").map(String::as_str), Some("10g"));
        assert_eq!(
            runner.command_lines(),
            vec!["lvs /dev/vg0/brick1 --noheadings -o vg_name,data_percent,lv_size --separator :"]
        );
    }

    #[test]
    fn test_details_partial_and_fallback_device() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvs /dev/vg0/snap1_0", "  vg0\n");
        // Not mounted, so the device argument is used
        let brick = BrickRecord::new("node1", "/srv/unmounted", Uuid::nil());

        let mut rsp = ResponseMap::new();
        LvmBackend
            .details(&ctx, &mut rsp, &brick, "vol0", "/dev/vg0/snap1_0", "brick1")
            .unwrap();
        assert_eq!(rsp.len(), 1);
        assert_eq!(rsp.get("brick1.vgname").map(String::as_str), Some("vg0"));
    }

    #[test]
    fn test_remove() {
        let (runner, mounts, daemon, ctx) = fixture();
        mounts.add_mount("/dev/vg0/snap1_0", SNAP_MOUNT, "xfs");
        let mut brick = snap_brick();
        brick.status = BrickStatus::Started;
        daemon.set_running(ctx.config.brick_pidfile("snapvol", &brick), 77);
        let snap_vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());

        let outcome = LvmBackend
            .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
            .unwrap();

        assert_eq!(outcome, RemoveOutcome::Removed);
        assert_eq!(brick.status, BrickStatus::Stopped);
        assert_eq!(mounts.umounts(), vec![PathBuf::from(SNAP_MOUNT)]);
        assert_eq!(runner.command_lines(), vec!["lvremove -f /dev/vg0/snap1_0"]);
        assert_eq!(mounts.removed_dirs(), vec![PathBuf::from(SNAP_MOUNT)]);
    }

    #[test]
    fn test_remove_degraded_when_unmount_keeps_failing() {
        let (runner, mounts, _, ctx) = fixture();
        mounts.add_mount("/dev/vg0/snap1_0", SNAP_MOUNT, "xfs");
        mounts.fail_umounts(u32::MAX);
        let mut brick = snap_brick();
        let snap_vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());

        let outcome = LvmBackend
            .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
            .unwrap();

        assert_eq!(outcome, RemoveOutcome::Degraded);
        assert_eq!(mounts.umounts().len(), 3);
        assert!(runner.calls_to(LVREMOVE).is_empty());
    }

    #[test]
    fn test_remove_detached_goes_straight_to_destroy() {
        let (runner, mounts, _, ctx) = fixture();
        let mut brick = snap_brick();
        let snap_vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());

        let outcome = LvmBackend
            .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);
        assert!(mounts.umounts().is_empty());
        assert_eq!(runner.calls_to(LVREMOVE).len(), 1);
    }

    #[test]
    fn test_remove_tolerates_busy_directory() {
        let (_, mounts, _, ctx) = fixture();
        mounts.fail_remove_dir(std::io::ErrorKind::DirectoryNotEmpty);
        let mut brick = snap_brick();
        let snap_vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());

        let outcome = LvmBackend
            .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);
    }

    #[test]
    fn test_remove_already_removed() {
        let (runner, _, _, ctx) = fixture();
        runner.fail_when(
            "lvremove",
            5,
            "  Failed to find logical volume \"vg0/snap1_0\"",
        );
        let mut brick = snap_brick();
        let snap_vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());

        let outcome = LvmBackend
            .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);

        runner.fail_when("lvremove", 5, "Volume group \"vg0\" not found");
        let outcome = LvmBackend
            .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);
    }

    #[test]
    fn test_remove_destroy_failure() {
        let (runner, _, _, ctx) = fixture();
        runner.fail_when("lvremove", 5, "Logical volume in use");
        let mut brick = snap_brick();
        let snap_vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());

        assert!(
            LvmBackend
                .remove(&ctx, &snap_vol, &mut brick, Path::new(SNAP_MOUNT), "/dev/vg0/snap1_0")
                .is_err()
        );
    }

    #[test]
    fn test_missed_create() {
        let (runner, _, _, ctx) = fixture();
        runner.respond("lvs --noheadings -o vg_name /dev/vg0/brick1", "vg0\n");
        let mut brick = BrickRecord::new("node1", format!("{}/b1", SNAP_MOUNT), Uuid::nil());
        let op = MissedSnapOp {
            volname: "snapvol".into(),
            snapname: "snap1".into(),
            node_uuid: Uuid::nil(),
            brick_path: "/bricks/b1".into(),
            brick_num: 2,
            op: SnapOpKind::Create,
        };

        LvmBackend
            .missed(&ctx, "snapvol", "snap1", &mut brick, &op)
            .unwrap();
        assert_eq!(brick.device_path, "/dev/vg0/snapvol_1");
        assert_eq!(
            runner.command_lines().last().unwrap(),
            "lvcreate -s /dev/vg0/brick1 --name /dev/vg0/snapvol_1"
        );
    }

    #[test]
    fn test_missed_delete() {
        let (runner, mounts, _, ctx) = fixture();
        mounts.add_mount("/dev/vg0/snap1_0", SNAP_MOUNT, "xfs");
        let mut brick = snap_brick();
        let op = MissedSnapOp {
            volname: "snapvol".into(),
            snapname: "snap1".into(),
            node_uuid: Uuid::nil(),
            brick_path: "/bricks/b1".into(),
            brick_num: 1,
            op: SnapOpKind::Delete,
        };

        LvmBackend
            .missed(&ctx, "snapvol", "snap1", &mut brick, &op)
            .unwrap();
        assert_eq!(mounts.umounts(), vec![PathBuf::from(SNAP_MOUNT)]);
        assert_eq!(runner.command_lines(), vec!["lvremove -f /dev/vg0/snap1_0"]);
    }

    #[test]
    fn test_mount() {
        let (runner, _, _, ctx) = fixture();
        let brick = snap_brick();
        LvmBackend.mount(&ctx, &brick, Path::new(SNAP_MOUNT)).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![format!("mount -o nouuid /dev/vg0/snap1_0 {}", SNAP_MOUNT)]
        );
    }
}
