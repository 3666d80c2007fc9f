//! Btrfs subvolume snapshots.
//!
//! A snapshot is a subvolume `@<snapname>_<index>` created next to the
//! origin subvolume on the same filesystem. The brick record has no field
//! for the subvolume name, so it travels in two places:
//!
//! * before creation, in `device_path` ([`encode_pending_subvol`]);
//! * after creation, in `mnt_opts` as `subvol=@<name>`
//!   ([`encode_committed_subvol`] / [`decode_committed_subvol`]), with
//!   `device_path` switched to the origin filesystem device.
//!
//! Creation and removal both work through a private mount of the whole
//! filesystem under `<run_dir>/btrfs/<subvol>`.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, instrument, warn};

use super::parse;
use super::{
    RemoveOutcome, SnapshotBackend, Teardown, mount_brick, mount_snapshot, probe_fstype,
    replay_missed_delete, stop_and_unmount, validate_snapname,
};
use crate::brick::{BrickRecord, MissedSnapOp, ResponseMap, SnapOpKind, SnapVolume};
use crate::context::SnapContext;
use crate::error::{Result, SnapshotError};
use crate::exec::run_checked;
use crate::host::cleanup_brick_dir;

pub const BTRFS: &str = "btrfs";

/// Options for the private mount of the whole filesystem.
const PRIVATE_MOUNT_OPTS: &str = "defaults";

/// Record `subvol` as the subvolume a pending `create` should produce.
pub fn encode_pending_subvol(brick: &mut BrickRecord, subvol: &str) {
    brick.device_path = subvol.to_string();
}

/// Subvolume name recorded by [`encode_pending_subvol`].
pub fn decode_pending_subvol(brick: &BrickRecord) -> Result<&str> {
    let subvol = brick.device_path.as_str();
    validate_snapname(subvol).map_err(|_| SnapshotError::MissingSubvolume(brick.identity()))?;
    Ok(subvol)
}

/// Mount options that select subvolume `subvol`.
pub fn encode_committed_subvol(subvol: &str) -> String {
    format!("default,subvol=@{}", subvol)
}

/// Subvolume name from mount options written by [`encode_committed_subvol`].
pub fn decode_committed_subvol(mnt_opts: &str) -> Option<&str> {
    parse::mount_option_value(mnt_opts, "subvol")
        .and_then(|value| value.strip_prefix('@'))
        .filter(|name| !name.is_empty())
}

/// Backend for bricks on Btrfs subvolumes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BtrfsBackend;

impl BtrfsBackend {
    const NAME: &'static str = "btrfs";

    /// Mount the whole filesystem on `device` at a fresh private mount point.
    fn mount_private(&self, ctx: &SnapContext, device: &str, subvol: &str) -> Result<PathBuf> {
        let mnt = ctx.btrfs_mount_dir(subvol);
        ctx.mounts().mkdir_p(&mnt).inspect_err(|e| {
            error!(backend = Self::NAME, path = %mnt.display(), error = %e, "Failed to create private mount point");
        })?;

        if let Err(e) = mount_snapshot(ctx, Self::NAME, device, PRIVATE_MOUNT_OPTS, BTRFS, &mnt) {
            if let Err(cleanup) = ctx.mounts().remove_dir_all(&mnt) {
                warn!(backend = Self::NAME, path = %mnt.display(), error = %cleanup, "Failed to remove private mount point");
            }
            return Err(e);
        }
        Ok(mnt)
    }

    /// Unmount and remove a private mount point.
    ///
    /// The directory is only removed once unmounted, so a busy mount never
    /// has its contents deleted.
    fn release_private(&self, ctx: &SnapContext, mnt: &Path) {
        if let Err(e) = ctx.mounts().umount(mnt) {
            error!(backend = Self::NAME, path = %mnt.display(), error = %e, "Failed to unmount private mount point");
            return;
        }
        if let Err(e) = ctx.mounts().remove_dir_all(mnt) {
            warn!(backend = Self::NAME, path = %mnt.display(), error = %e, "Failed to remove private mount point");
        }
    }

    /// Delete the subvolume at `path`, treating one that is already gone
    /// as deleted.
    fn delete_subvolume(&self, ctx: &SnapContext, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        match run_checked(ctx.runner(), BTRFS, &["subvolume", "delete", &path_str]) {
            Ok(_) => {
                info!(backend = Self::NAME, path = %path_str, "btrfs snapshot removed");
                Ok(())
            }
            Err(SnapshotError::CommandFailed { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                info!(backend = Self::NAME, path = %path_str, "Subvolume already deleted (idempotent)");
                Ok(())
            }
            Err(e) => {
                error!(backend = Self::NAME, path = %path_str, error = %e, "Failed to delete subvolume");
                Err(e)
            }
        }
    }
}

impl SnapshotBackend for BtrfsBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn probe(&self, ctx: &SnapContext, brick_path: &Path) -> bool {
        probe_fstype(ctx, Self::NAME, brick_path, BTRFS)
    }

    fn details(
        &self,
        _ctx: &SnapContext,
        _rsp: &mut ResponseMap,
        brick: &BrickRecord,
        volname: &str,
        _device: &str,
        _key_prefix: &str,
    ) -> Result<()> {
        // Usage figures would need filesystem quotas enabled
        warn!(
            backend = Self::NAME,
            volume = %volname,
            brick = %brick.identity(),
            "Brick details are not supported for btrfs"
        );
        Err(SnapshotError::Unsupported {
            backend: Self::NAME,
            operation: "details",
        })
    }

    /// The origin is not consulted: `create` resolves the filesystem device
    /// from the origin brick path.
    fn device(
        &self,
        _ctx: &SnapContext,
        _origin: &str,
        snapname: &str,
        brick_index: u32,
    ) -> Result<String> {
        validate_snapname(snapname)?;
        Ok(format!("{}_{}", snapname, brick_index))
    }

    #[instrument(skip(self, ctx, brick), fields(backend = "btrfs", brick = %brick.identity()))]
    fn create(
        &self,
        ctx: &SnapContext,
        brick: &mut BrickRecord,
        origin_brick_path: &Path,
    ) -> Result<()> {
        let subvol = decode_pending_subvol(brick)
            .inspect_err(|e| error!(error = %e, "No subvolume name recorded on brick"))?
            .to_string();

        let origin_mnt = ctx.mounts().brick_root(origin_brick_path).inspect_err(|e| {
            error!(origin = %origin_brick_path.display(), error = %e, "Failed to get the mount root of the origin brick");
        })?;
        let origin_device = ctx.mounts().mount_entry(&origin_mnt).inspect_err(|e| {
            error!(origin = %origin_mnt.display(), error = %e, "Failed to get the device of the origin brick");
        })?.fsname;

        let mnt = self.mount_private(ctx, &origin_device, &subvol)?;

        let target = mnt.join(format!("@{}", subvol));
        let origin_mnt_str = origin_mnt.to_string_lossy();
        let target_str = target.to_string_lossy();
        info!(origin = %origin_mnt_str, target = %target_str, "Taking btrfs snapshot");

        if let Err(e) = run_checked(
            ctx.runner(),
            BTRFS,
            &["subvolume", "snapshot", &origin_mnt_str, &target_str],
        ) {
            error!(origin = %origin_mnt_str, target = %target_str, error = %e, "Taking snapshot of the brick failed");
            self.release_private(ctx, &mnt);
            return Err(e);
        }

        brick.device_path = origin_device;
        brick.mnt_opts = encode_committed_subvol(&subvol);
        if brick.fstype.is_empty() {
            brick.fstype = BTRFS.to_string();
        }
        self.release_private(ctx, &mnt);

        info!(subvolume = %subvol, "btrfs snapshot created successfully");
        Ok(())
    }

    #[instrument(skip(self, ctx, brick, op), fields(backend = "btrfs", brick = %brick.identity(), op = %op.op))]
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
                let subvol = self.device(ctx, "", volname, op.brick_index()?)?;
                encode_pending_subvol(brick, &subvol);
                self.create(ctx, brick, &op.brick_path)
            }
            SnapOpKind::Delete => replay_missed_delete(self, ctx, volname, snapname, brick),
        }
    }

    #[instrument(skip(self, ctx, snap_vol, brick), fields(backend = "btrfs", volume = %snap_vol.volname, brick = %brick.identity()))]
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

        let subvol = decode_committed_subvol(&brick.mnt_opts)
            .map(str::to_string)
            .ok_or_else(|| {
                error!(mnt_opts = %brick.mnt_opts, "No subvolume in brick mount options");
                SnapshotError::MissingSubvolume(brick.identity())
            })?;
        let device = if brick.device_path.is_empty() {
            snap_device
        } else {
            brick.device_path.as_str()
        };
        debug!(subvolume = %subvol, device = %device, "Removing btrfs snapshot");

        let mnt = self.mount_private(ctx, device, &subvol)?;
        let deleted = self.delete_subvolume(ctx, &mnt.join(format!("@{}", subvol)));
        self.release_private(ctx, &mnt);
        deleted?;

        // Errors are logged by the helper; the subvolume itself is gone
        let _ = cleanup_brick_dir(ctx.mounts(), mount_pt);
        Ok(RemoveOutcome::Removed)
    }

    fn mount(&self, ctx: &SnapContext, brick: &BrickRecord, target: &Path) -> Result<()> {
        mount_brick(ctx, Self::NAME, brick, target)
    }
}
