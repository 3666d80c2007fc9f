//! Snapshot service for one node.
//!
//! Drives the backends for every local brick of a snapshot volume. Brick
//! operations run on the blocking thread pool since each one is a sequence
//! of native commands; a semaphore bounds how many run at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::state::SnapState;
use crate::backend::{BackendKind, RemoveOutcome, SnapshotBackend, probe_backend, select_backend};
use crate::brick::{BACKEND_OPTION, BrickRecord, ResponseMap, SnapVolume};
use crate::context::SnapContext;
use crate::error::{Result, SnapshotError};
use crate::metrics::{self, OperationTimer};

/// Default maximum number of concurrent brick operations
pub const DEFAULT_MAX_CONCURRENT_OPS: usize = 10;

/// Outcome of one brick operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrickReport {
    pub brick: String,
    pub backend: String,
    /// `created`, `removed`, `degraded`, ... or the error code
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BrickReport {
    fn ok(brick: &str, backend: &str, status: &str) -> Self {
        Self {
            brick: brick.to_string(),
            backend: backend.to_string(),
            status: status.to_string(),
            error: None,
        }
    }

    fn failed(brick: &str, backend: &str, err: &SnapshotError) -> Self {
        Self {
            brick: brick.to_string(),
            backend: backend.to_string(),
            status: err.code().to_string(),
            error: Some(err.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the brick's snapshot resource may still exist.
    pub fn leaves_resource(&self) -> bool {
        self.is_failure() || self.status == "degraded"
    }
}

/// Backend claiming a brick path, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub path: PathBuf,
    pub backend: Option<BackendKind>,
}

/// Finished brick operation handed back by a worker.
struct BrickTask<T> {
    index: usize,
    brick: BrickRecord,
    backend: &'static str,
    result: Result<T>,
}

/// Select the backend for `brick` and run `op` with it, timing the call.
fn run_on_brick<T>(
    ctx: &SnapContext,
    operation: &'static str,
    forced: Option<&str>,
    probe_path: &Path,
    brick: &mut BrickRecord,
    op: impl FnOnce(&SnapContext, &dyn SnapshotBackend, &mut BrickRecord) -> Result<T>,
) -> (&'static str, Result<T>) {
    let backend = match select_backend(ctx, forced, probe_path) {
        Ok(backend) => backend,
        Err(e) => return ("none", Err(e)),
    };

    let timer = OperationTimer::new(backend.name(), operation);
    let result = op(ctx, backend, brick);
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.failure(e.code()),
    }
    (backend.name(), result)
}

/// Resolve the origin brick, name the snapshot after `volname` and take it.
fn create_brick(
    ctx: &SnapContext,
    backend: &dyn SnapshotBackend,
    volname: &str,
    index: usize,
    brick: &mut BrickRecord,
) -> Result<()> {
    let origin = brick
        .origin_path
        .clone()
        .ok_or_else(|| SnapshotError::MissingOrigin(brick.identity()))?;
    let origin_root = ctx.mounts().brick_root(&origin)?;
    let origin_entry = ctx.mounts().mount_entry(&origin_root)?;

    brick.device_path = backend.device(ctx, &origin_entry.fsname, volname, index as u32)?;
    if brick.fstype.is_empty() {
        brick.fstype = origin_entry.fstype;
    }
    backend.create(ctx, brick, &origin)
}

/// Runs backend operations for the bricks hosted on this node.
pub struct SnapshotService {
    ctx: Arc<SnapContext>,
    /// Semaphore bounding concurrent brick operations
    ops_semaphore: Arc<Semaphore>,
    max_concurrent_ops: usize,
}

impl SnapshotService {
    /// Create a new SnapshotService with the default concurrency limit
    pub fn new(ctx: SnapContext) -> Self {
        Self::with_concurrency_limit(ctx, DEFAULT_MAX_CONCURRENT_OPS)
    }

    /// Create a new SnapshotService with a configurable concurrency limit
    pub fn with_concurrency_limit(ctx: SnapContext, max_concurrent_ops: usize) -> Self {
        let max_concurrent_ops = max_concurrent_ops.max(1);
        Self {
            ctx: Arc::new(ctx),
            ops_semaphore: Arc::new(Semaphore::new(max_concurrent_ops)),
            max_concurrent_ops,
        }
    }

    pub fn context(&self) -> &SnapContext {
        &self.ctx
    }

    fn is_local(&self, brick: &BrickRecord) -> bool {
        brick.hostname == self.ctx.node.hostname
    }

    /// Wait for a permit, then run `f` on the blocking pool.
    async fn spawn_worker<T, F>(&self, f: F) -> Option<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&SnapContext) -> T + Send + 'static,
    {
        let permit = match self.ops_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "Operation semaphore closed");
                return None;
            }
        };
        metrics::set_concurrent_ops(self.in_flight());

        let ctx = self.ctx.clone();
        let semaphore = self.ops_semaphore.clone();
        let max_concurrent_ops = self.max_concurrent_ops;
        Some(tokio::task::spawn_blocking(move || {
            let result = f(&ctx);
            drop(permit);
            metrics::set_concurrent_ops(max_concurrent_ops - semaphore.available_permits());
            result
        }))
    }

    /// Brick operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent_ops - self.ops_semaphore.available_permits()
    }

    /// Run `op` on every local brick of `vol` and collect the results.
    async fn fan_out<T, F>(
        &self,
        operation: &'static str,
        vol: &SnapVolume,
        op: F,
    ) -> Vec<BrickTask<T>>
    where
        T: Send + 'static,
        F: Fn(&SnapContext, &dyn SnapshotBackend, usize, &mut BrickRecord) -> Result<T>
            + Send
            + Sync
            + 'static,
    {
        let op = Arc::new(op);
        let forced = vol.forced_backend().map(str::to_string);
        let mut handles = Vec::with_capacity(vol.bricks.len());

        for (index, brick) in vol.bricks.iter().enumerate() {
            if !self.is_local(brick) {
                debug!(brick = %brick.identity(), "Skipping remote brick");
                continue;
            }

            let op = op.clone();
            let forced = forced.clone();
            let mut brick = brick.clone();
            let handle = self
                .spawn_worker(move |ctx| {
                    let probe_path = brick.origin_path.clone().unwrap_or_else(|| brick.path.clone());
                    let (backend, result) = run_on_brick(
                        ctx,
                        operation,
                        forced.as_deref(),
                        &probe_path,
                        &mut brick,
                        |ctx, backend, brick| (*op)(ctx, backend, index, brick),
                    );
                    BrickTask {
                        index,
                        brick,
                        backend,
                        result,
                    }
                })
                .await;
            match handle {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }

        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(task) => tasks.push(task),
                Err(e) => error!(operation, error = %e, "Brick worker failed"),
            }
        }
        tasks
    }

    /// Write worker results back into `vol` and turn them into reports.
    fn collect<T>(
        vol: &mut SnapVolume,
        tasks: Vec<BrickTask<T>>,
        mut describe: impl FnMut(T) -> &'static str,
    ) -> Vec<BrickReport> {
        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            let identity = task.brick.identity();
            let report = match task.result {
                Ok(value) => BrickReport::ok(&identity, task.backend, describe(value)),
                Err(ref e) => BrickReport::failed(&identity, task.backend, e),
            };
            if let Some(slot) = vol.bricks.get_mut(task.index) {
                *slot = task.brick;
            }
            reports.push(report);
        }
        reports
    }

    /// Report the backend claiming each path.
    pub async fn probe_paths(&self, paths: Vec<PathBuf>) -> Vec<ProbeReport> {
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let handle = self
                .spawn_worker(move |ctx| {
                    let backend = probe_backend(ctx, &path);
                    ProbeReport { path, backend }
                })
                .await;
            match handle {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Probe worker failed"),
            }
        }
        reports
    }

    /// Take snapshots for every local brick of `vol`.
    ///
    /// Each brick needs its origin brick path. The chosen backend is stored
    /// in the volume options so later operations do not have to probe.
    #[instrument(skip(self, vol), fields(volume = %vol.volname, node = %self.ctx.node))]
    pub async fn create_volume(&self, vol: &mut SnapVolume) -> Vec<BrickReport> {
        let volname = vol.volname.clone();
        let tasks = self
            .fan_out("create", vol, move |ctx, backend, index, brick| {
                create_brick(ctx, backend, &volname, index, brick)
            })
            .await;

        if vol.forced_backend().is_none()
            && let Some(task) = tasks
                .iter()
                .find(|task| task.result.is_ok() && task.backend != "none")
        {
            info!(backend = task.backend, "Recording snapshot backend");
            vol.options
                .insert(BACKEND_OPTION.to_string(), task.backend.to_string());
        }

        let reports = Self::collect(vol, tasks, |()| "created");
        info!(
            bricks = reports.len(),
            failed = reports.iter().filter(|r| r.is_failure()).count(),
            "Snapshot create finished"
        );
        reports
    }

    /// Mount every local brick of `vol` at its brick path.
    #[instrument(skip(self, vol), fields(volume = %vol.volname, node = %self.ctx.node))]
    pub async fn mount_volume(&self, vol: &mut SnapVolume) -> Vec<BrickReport> {
        let tasks = self
            .fan_out("mount", vol, |ctx, backend, _, brick| {
                ctx.mounts().mkdir_p(&brick.path)?;
                backend.mount(ctx, brick, &brick.path)
            })
            .await;
        Self::collect(vol, tasks, |()| "mounted")
    }

    /// Gather capacity figures for every local brick under `brick<index>`.
    #[instrument(skip(self, vol), fields(volume = %vol.volname, node = %self.ctx.node))]
    pub async fn details_volume(&self, vol: &mut SnapVolume) -> (ResponseMap, Vec<BrickReport>) {
        let volname = vol.volname.clone();
        let tasks = self
            .fan_out("details", vol, move |ctx, backend, index, brick| {
                let mut rsp = ResponseMap::new();
                let prefix = format!("brick{}", index);
                backend.details(ctx, &mut rsp, brick, &volname, &brick.device_path, &prefix)?;
                Ok(rsp)
            })
            .await;

        let mut merged = ResponseMap::new();
        let reports = Self::collect(vol, tasks, |rsp| {
            merged.extend(rsp);
            "reported"
        });
        (merged, reports)
    }

    /// Stop, unmount and destroy the snapshot of every local brick.
    #[instrument(skip(self, vol), fields(volume = %vol.volname, node = %self.ctx.node))]
    pub async fn remove_volume(&self, vol: &mut SnapVolume) -> Vec<BrickReport> {
        let snap_vol = Arc::new(vol.clone());
        let tasks = self
            .fan_out("remove", vol, move |ctx, backend, _, brick| {
                let mount_pt = brick.path.clone();
                let device = brick.device_path.clone();
                backend.remove(ctx, &snap_vol, brick, &mount_pt, &device)
            })
            .await;

        Self::collect(vol, tasks, |outcome| match outcome {
            RemoveOutcome::Removed => "removed",
            RemoveOutcome::Degraded => {
                warn!("Snapshot left in place on at least one brick");
                "degraded"
            }
        })
    }

    /// Replay the missed operations addressed to this node.
    ///
    /// Replayed operations are dropped from `state`; failed ones stay queued.
    #[instrument(skip(self, state), fields(node = %self.ctx.node, pending = state.missed.len()))]
    pub async fn replay_missed(&self, state: &mut SnapState) -> Vec<BrickReport> {
        let mut handles = Vec::new();
        let mut reports = Vec::new();

        for (op_index, op) in state.missed.iter().enumerate() {
            if let Some(uuid) = self.ctx.node.uuid
                && op.node_uuid != uuid
            {
                debug!(volume = %op.volname, node = %op.node_uuid, "Missed operation belongs to another node");
                continue;
            }

            let subject = format!("{}:brick{}", op.volname, op.brick_num);
            let located = state.volume(&op.volname).and_then(|vol| {
                let index = op.brick_index()?;
                let brick = vol.bricks.get(index as usize).ok_or_else(|| {
                    SnapshotError::BrickNotFound {
                        volume: op.volname.clone(),
                        brick_num: op.brick_num,
                    }
                })?;
                Ok((vol.forced_backend().map(str::to_string), brick.clone()))
            });
            let (forced, mut brick) = match located {
                Ok(found) => found,
                Err(e) => {
                    warn!(op = %op.op, subject = %subject, error = %e, "Cannot replay missed operation");
                    reports.push(BrickReport::failed(&subject, "none", &e));
                    continue;
                }
            };
            if !self.is_local(&brick) {
                debug!(op = %op.op, brick = %brick.identity(), "Missed operation is for a remote brick");
                continue;
            }

            let op = op.clone();
            let handle = self
                .spawn_worker(move |ctx| {
                    let (backend, result) = run_on_brick(
                        ctx,
                        "missed",
                        forced.as_deref(),
                        &op.brick_path,
                        &mut brick,
                        |ctx, backend, brick| {
                            backend.missed(ctx, &op.volname, &op.snapname, brick, &op)
                        },
                    );
                    (op_index, op, brick, backend, result)
                })
                .await;
            match handle {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }

        let mut replayed = Vec::new();
        for handle in handles {
            let (op_index, op, brick, backend, result) = match handle.await {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Missed operation worker failed");
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    info!(op = %op.op, volume = %op.volname, brick = %brick.identity(), "Missed operation replayed");
                    reports.push(BrickReport::ok(&brick.identity(), backend, "replayed"));
                    replayed.push(op_index);
                    if let Ok(index) = op.brick_index()
                        && let Ok(vol) = state.volume_mut(&op.volname)
                        && let Some(slot) = vol.bricks.get_mut(index as usize)
                    {
                        *slot = brick;
                    }
                }
                Err(e) => reports.push(BrickReport::failed(&brick.identity(), backend, &e)),
            }
        }

        let mut index = 0;
        state.missed.retain(|_| {
            let keep = !replayed.contains(&index);
            index += 1;
            keep
        });
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::brick::{BrickStatus, MissedSnapOp, SnapOpKind};
    use crate::fakes::{FakeDaemon, FakeMounts, FakeRunner};

    fn service() -> (Arc<FakeRunner>, Arc<FakeMounts>, SnapshotService) {
        let runner = Arc::new(FakeRunner::new());
        let mounts = Arc::new(FakeMounts::new());
        let ctx = SnapContext::fake(runner.clone(), mounts.clone(), Arc::new(FakeDaemon::new()));
        (runner, mounts, SnapshotService::with_concurrency_limit(ctx, 2))
    }

    fn lvm_volume() -> SnapVolume {
        let mut vol = SnapVolume::named("snapvol", "snap1", Uuid::nil());
        for (host, n) in [("node1", 1), ("node2", 2), ("node1", 3)] {
            let mut brick = BrickRecord::new(
                host,
                format!("/run/gluster/snaps/snapvol/brick{}/b", n),
                Uuid::nil(),
            );
            brick.origin_path = Some(PathBuf::from(format!("/bricks/b{}", n)));
            vol.bricks.push(brick);
        }
        vol
    }

    #[tokio::test]
    async fn test_create_volume_only_touches_local_bricks() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/vg0/brick1", "/bricks/b1", "xfs");
        mounts.add_mount("/dev/vg0/brick3", "/bricks/b3", "xfs");
        runner.respond("lvs --noheadings -o pool_lv", "pool0\n");
        runner.respond("lvs --noheadings -o vg_name", "vg0\n");

        let mut vol = lvm_volume();
        let reports = service.create_volume(&mut vol).await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| !r.is_failure() && r.backend == "lvm"));
        assert_eq!(vol.bricks[0].device_path, "/dev/vg0/snapvol_0");
        assert_eq!(vol.bricks[0].fstype, "xfs");
        assert_eq!(vol.bricks[1].device_path, "");
        assert_eq!(vol.bricks[2].device_path, "/dev/vg0/snapvol_2");
        assert_eq!(vol.forced_backend(), Some("lvm"));
        assert_eq!(runner.calls_to("lvcreate").len(), 4);
    }

    #[tokio::test]
    async fn test_create_volume_reports_failures_per_brick() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/vg0/brick1", "/bricks/b1", "xfs");
        runner.respond("lvs --noheadings -o vg_name", "vg0\n");

        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "lvm".into());
        let reports = service.create_volume(&mut vol).await;

        // brick3's origin is not mounted
        assert_eq!(reports.len(), 2);
        assert!(!reports[0].is_failure());
        assert_eq!(reports[1].status, "brick_root");
    }

    #[tokio::test]
    async fn test_details_volume() {
        let (runner, mounts, service) = service();
        runner.respond("lvs", "  vg0:12.5:1g\n");
        mounts.add_mount("/dev/vg0/snapvol_0", "/run/gluster/snaps/snapvol/brick1/b", "xfs");
        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "lvm".into());
        vol.bricks[0].device_path = "/dev/vg0/snapvol_0".into();
        vol.bricks[2].device_path = "/dev/vg0/snapvol_2".into();

        let (rsp, reports) = service.details_volume(&mut vol).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(rsp.get("brick0.data").map(String::as_str), Some("12.5"));
        assert_eq!(rsp.get("brick2.lvsize").map(String::as_str), Some("1g"));
        assert!(!rsp.contains_key("brick1.vgname"));
    }

    #[tokio::test]
    async fn test_remove_volume() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/vg0/snapvol_0", "/run/gluster/snaps/snapvol/brick1/b", "xfs");
        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "lvm".into());
        vol.bricks[0].device_path = "/dev/vg0/snapvol_0".into();
        vol.bricks[0].status = BrickStatus::Started;
        vol.bricks[2].device_path = "/dev/vg0/snapvol_2".into();

        let reports = service.remove_volume(&mut vol).await;
        assert!(reports.iter().all(|r| r.status == "removed"));
        assert_eq!(runner.calls_to("lvremove").len(), 2);
        assert_eq!(mounts.umounts().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_volume_degraded_leaves_resource() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/vg0/snapvol_0", "/run/gluster/snaps/snapvol/brick1/b", "xfs");
        mounts.fail_umounts(u32::MAX);
        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "lvm".into());
        vol.bricks[0].device_path = "/dev/vg0/snapvol_0".into();
        vol.bricks[2].device_path = "/dev/vg0/snapvol_2".into();

        let reports = service.remove_volume(&mut vol).await;
        assert_eq!(reports[0].status, "degraded");
        assert!(!reports[0].is_failure());
        assert!(reports[0].leaves_resource());
        assert!(!reports[1].leaves_resource());
        assert_eq!(runner.calls_to("lvremove").len(), 1);
    }

    #[tokio::test]
    async fn test_permits_released_after_fan_out() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/vg0/brick1", "/bricks/b1", "xfs");
        mounts.add_mount("/dev/vg0/brick3", "/bricks/b3", "xfs");
        runner.respond("lvs --noheadings -o vg_name", "vg0\n");

        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "lvm".into());
        service.create_volume(&mut vol).await;
        assert_eq!(service.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_probe_paths() {
        let (_, mounts, service) = service();
        mounts.add_mount("/dev/sdb1", "/bricks/b2", "btrfs");
        // No `lvs` rule, so every LVM probe sees a thick volume
        let reports = service
            .probe_paths(vec![PathBuf::from("/bricks/b2"), PathBuf::from("/srv")])
            .await;
        assert_eq!(reports[0].backend, Some(BackendKind::Btrfs));
        assert_eq!(reports[1].backend, None);
    }

    #[tokio::test]
    async fn test_replay_missed() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/sdb1", "/bricks/b1", "btrfs");

        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "btrfs".into());
        let missed = |brick_num, volname: &str| MissedSnapOp {
            volname: volname.into(),
            snapname: "snap1".into(),
            node_uuid: Uuid::nil(),
            brick_path: PathBuf::from("/bricks/b1"),
            brick_num,
            op: SnapOpKind::Create,
        };
        let mut state = SnapState {
            volumes: vec![vol],
            missed: vec![missed(1, "snapvol"), missed(9, "snapvol"), missed(1, "gone")],
        };

        let reports = service.replay_missed(&mut state).await;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().filter(|r| r.is_failure()).count(), 2);
        assert_eq!(state.missed.len(), 2);
        assert_eq!(
            state.volumes[0].bricks[0].mnt_opts,
            "default,subvol=@snapvol_0"
        );
        assert_eq!(runner.calls_to("btrfs").len(), 1);
    }

    #[tokio::test]
    async fn test_replay_missed_skips_remote_bricks() {
        let (runner, mounts, service) = service();
        mounts.add_mount("/dev/sdb1", "/bricks/b1", "btrfs");

        let mut vol = lvm_volume();
        vol.options.insert(BACKEND_OPTION.into(), "btrfs".into());
        let mut state = SnapState {
            volumes: vec![vol],
            // Brick 2 is hosted on node2
            missed: vec![MissedSnapOp {
                volname: "snapvol".into(),
                snapname: "snap1".into(),
                node_uuid: Uuid::nil(),
                brick_path: PathBuf::from("/bricks/b1"),
                brick_num: 2,
                op: SnapOpKind::Create,
            }],
        };

        let reports = service.replay_missed(&mut state).await;
        assert!(reports.is_empty());
        assert_eq!(state.missed.len(), 1);
        assert!(runner.calls().is_empty());
        assert_eq!(state.volumes[0].bricks[1].mnt_opts, "");
    }
}
