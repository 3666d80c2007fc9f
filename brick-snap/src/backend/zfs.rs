//! ZFS snapshots served through clones.
//!
//! The brick's `device_path` holds the snapshot name `<dataset>@<id>`; the
//! brick itself is served from the writable clone `<dataset>/<id>`, whose
//! mountpoint is pointed at the brick path.

use std::fmt::{self, Display};
use std::path::Path;

use tracing::{debug, error, info, instrument, warn};

use super::parse;
use super::{
    RemoveOutcome, SnapshotBackend, Teardown, probe_fstype, replay_missed_delete,
    stop_and_unmount, validate_snapname,
};
use crate::brick::{BrickRecord, MissedSnapOp, ResponseMap, SnapOpKind, SnapVolume, response_key};
use crate::context::SnapContext;
use crate::error::{Result, SnapshotError};
use crate::exec::run_checked;
use crate::host::cleanup_brick_dir;

pub const ZFS: &str = "zfs";
pub const ZPOOL: &str = "zpool";

/// A snapshot identifier `<dataset>@<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZfsSnapshotName {
    dataset: String,
    id: String,
}

impl ZfsSnapshotName {
    pub fn parse(device: &str) -> Result<Self> {
        match device.trim().split_once('@') {
            Some((dataset, id)) if !dataset.is_empty() && !id.is_empty() && !id.contains('@') => {
                Ok(Self {
                    dataset: dataset.to_string(),
                    id: id.to_string(),
                })
            }
            _ => Err(SnapshotError::InvalidDevice(device.to_string())),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `<dataset>@<id>`
    pub fn snapshot(&self) -> String {
        format!("{}@{}", self.dataset, self.id)
    }

    /// `<dataset>/<id>`, the clone serving the brick.
    pub fn clone_dataset(&self) -> String {
        format!("{}/{}", self.dataset, self.id)
    }
}

impl Display for ZfsSnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.id)
    }
}

/// Backend for bricks on ZFS datasets.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZfsBackend;

impl ZfsBackend {
    const NAME: &'static str = "zfs";

    fn zfs(&self, ctx: &SnapContext, args: &[&str]) -> Result<String> {
        run_checked(ctx.runner(), ZFS, args)
            .map(|output| output.stdout)
            .inspect_err(|e| {
                error!(backend = Self::NAME, error = %e, "zfs command failed");
            })
    }

    /// Destroy `dataset`, treating one that no longer exists as destroyed.
    fn destroy(&self, ctx: &SnapContext, dataset: &str) -> Result<()> {
        match run_checked(ctx.runner(), ZFS, &["destroy", dataset]) {
            Ok(_) => {
                info!(backend = Self::NAME, dataset, "ZFS dataset destroyed");
                Ok(())
            }
            Err(SnapshotError::CommandFailed { stderr, .. }) if stderr.contains("does not exist") => {
                info!(backend = Self::NAME, dataset, "Dataset already destroyed (idempotent)");
                Ok(())
            }
            Err(e) => {
                error!(backend = Self::NAME, dataset, error = %e, "Failed to destroy dataset");
                Err(e)
            }
        }
    }

    fn snapshot_name(&self, brick: &BrickRecord, device: &str) -> Result<ZfsSnapshotName> {
        ZfsSnapshotName::parse(device).inspect_err(|e| {
            error!(backend = Self::NAME, brick = %brick.identity(), error = %e, "Malformed ZFS snapshot name");
        })
    }
}

impl SnapshotBackend for ZfsBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn probe(&self, ctx: &SnapContext, brick_path: &Path) -> bool {
        for tool in [ZFS, ZPOOL] {
            if !ctx.runner().is_available(tool) {
                error!(backend = Self::NAME, tool, "ZFS commands not found");
                return false;
            }
        }
        probe_fstype(ctx, Self::NAME, brick_path, ZFS)
    }

    #[instrument(skip(self, ctx, rsp, brick), fields(backend = "zfs", brick = %brick.identity()))]
    fn details(
        &self,
        ctx: &SnapContext,
        rsp: &mut ResponseMap,
        brick: &BrickRecord,
        volname: &str,
        device: &str,
        key_prefix: &str,
    ) -> Result<()> {
        let device = if device.is_empty() {
            brick.device_path.as_str()
        } else {
            device
        };
        if device.is_empty() {
            error!(volume = %volname, "No snapshot recorded on brick");
            return Err(SnapshotError::InvalidDevice(device.to_string()));
        }

        let stdout = self
            .zfs(ctx, &["list", "-Ho", "used", "-t", "snapshot", device])
            .inspect_err(|_| {
                error!(volume = %volname, device = %device, "Failed to get brick details");
            })?;

        rsp.insert(response_key(key_prefix, "vgname"), device.to_string());
        if let Some(used) = stdout.lines().next().map(str::trim).filter(|used| !used.is_empty()) {
            rsp.insert(response_key(key_prefix, "lvsize"), used.to_string());
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

        let stdout = self
            .zfs(ctx, &["list", "-Ho", "name", origin])
            .inspect_err(|_| {
                error!(backend = Self::NAME, device = %origin, "Failed to get dataset name");
            })?;
        let dataset = parse::dataset_name(&stdout)?;

        Ok(format!("{}@{}_{}", dataset, snapname, brick_index))
    }

    /// Snapshot, clone, then point the clone at the brick path. A failed
    /// step leaves the earlier ones in place.
    #[instrument(skip(self, ctx, brick), fields(backend = "zfs", brick = %brick.identity()))]
    fn create(
        &self,
        ctx: &SnapContext,
        brick: &mut BrickRecord,
        origin_brick_path: &Path,
    ) -> Result<()> {
        let name = self.snapshot_name(brick, &brick.device_path)?;
        let snapshot = name.snapshot();
        let clone = name.clone_dataset();
        let mountpoint = format!("mountpoint={}", brick.path.display());

        info!(origin = %origin_brick_path.display(), snapshot = %snapshot, "Taking ZFS snapshot");
        self.zfs(ctx, &["snapshot", &snapshot]).inspect_err(|_| {
            error!(snapshot = %snapshot, "Taking snapshot of the brick failed");
        })?;

        self.zfs(ctx, &["clone", &snapshot, &clone]).inspect_err(|_| {
            error!(snapshot = %snapshot, clone = %clone, "Cloning snapshot failed");
        })?;

        self.zfs(ctx, &["set", &mountpoint, &clone]).inspect_err(|_| {
            error!(clone = %clone, path = %brick.path.display(), "Setting clone mountpoint failed");
        })?;

        info!(snapshot = %snapshot, clone = %clone, "ZFS snapshot created successfully");
        Ok(())
    }

    #[instrument(skip(self, ctx, brick, op), fields(backend = "zfs", brick = %brick.identity(), op = %op.op))]
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

    #[instrument(skip(self, ctx, snap_vol, brick), fields(backend = "zfs", volume = %snap_vol.volname, brick = %brick.identity()))]
    fn remove(
        &self,
        ctx: &SnapContext,
        snap_vol: &SnapVolume,
        brick: &mut BrickRecord,
        mount_pt: &Path,
        snap_device: &str,
    ) -> Result<RemoveOutcome> {
        let device = if snap_device.is_empty() {
            brick.device_path.clone()
        } else {
            snap_device.to_string()
        };
        let name = self.snapshot_name(brick, &device)?;

        if stop_and_unmount(ctx, Self::NAME, snap_vol, brick, mount_pt) == Teardown::UnmountFailed {
            warn!(device = %device, "Snapshot left in place after failed unmount");
            return Ok(RemoveOutcome::Degraded);
        }

        // The clone depends on the snapshot
        debug!(snapshot = %name, "Removing ZFS snapshot");
        self.destroy(ctx, &name.clone_dataset())?;
        self.destroy(ctx, &name.snapshot())?;

        // Errors are logged by the helper; the datasets are gone
        let _ = cleanup_brick_dir(ctx.mounts(), mount_pt);
        Ok(RemoveOutcome::Removed)
    }

    fn mount(&self, ctx: &SnapContext, brick: &BrickRecord, target: &Path) -> Result<()> {
        let name = self.snapshot_name(brick, &brick.device_path)?;
        let clone = name.clone_dataset();
        let mountpoint = format!("mountpoint={}", target.display());

        self.zfs(ctx, &["set", &mountpoint, &clone])
            .map(|_| ())
            .inspect_err(|_| {
                error!(backend = Self::NAME, clone = %clone, target = %target.display(), "Failed to mount snapshot clone");
            })
    }
}
