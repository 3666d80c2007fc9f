//! Brick and snapshot-volume records.
//!
//! These are owned by the configuration store; the backends only mutate the
//! few fields documented on [`BrickRecord`].

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SnapshotError};

/// Volume option naming a forced snapshot backend.
pub const BACKEND_OPTION: &str = "snap.backend";

/// Response map filled by the brick detail reporters.
pub type ResponseMap = BTreeMap<String, String>;

/// Build a response map key of the form `<prefix>.<field>`.
pub fn response_key(prefix: &str, field: &str) -> String {
    format!("{}.{}", prefix, field)
}

/// Run state of a brick process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrickStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl Display for BrickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrickStatus::Stopped => write!(f, "stopped"),
            BrickStatus::Starting => write!(f, "starting"),
            BrickStatus::Started => write!(f, "started"),
            BrickStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// One storage brick participating in a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickRecord {
    /// Host serving the brick
    pub hostname: String,
    /// Brick directory
    pub path: PathBuf,
    /// Brick of the source volume this snapshot brick was taken from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_path: Option<PathBuf>,
    /// Backing device or snapshot identifier; format depends on the backend
    #[serde(default)]
    pub device_path: String,
    /// Mount options used when the brick is mounted
    #[serde(default)]
    pub mnt_opts: String,
    /// Filesystem type of the backing device
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub status: BrickStatus,
    /// Owning volume
    pub volume_id: Uuid,
}

impl BrickRecord {
    pub fn new(hostname: impl Into<String>, path: impl Into<PathBuf>, volume_id: Uuid) -> Self {
        Self {
            hostname: hostname.into(),
            path: path.into(),
            origin_path: None,
            device_path: String::new(),
            mnt_opts: String::new(),
            fstype: String::new(),
            status: BrickStatus::default(),
            volume_id,
        }
    }

    /// `host:/path` form used in log messages.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.hostname, self.path.display())
    }

    /// Brick path with the leading slash dropped and the rest replaced by
    /// dashes, as used in pid file names.
    pub fn dashed_path(&self) -> String {
        let path = self.path.to_string_lossy();
        path.trim_start_matches('/').replace('/', "-")
    }
}

/// Whether a volume is a snapshot itself or was restored from one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    #[default]
    Snapshot,
    Restored,
}

/// Bricks that together form one point-in-time snapshot of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapVolume {
    /// Name of the snapshot volume; also the naming key for snapshot devices
    pub volname: String,
    pub volume_id: Uuid,
    /// User visible snapshot name
    pub snapname: String,
    /// Volume the snapshot was taken from
    pub parent_volname: String,
    #[serde(default)]
    pub kind: VolumeKind,
    #[serde(default)]
    pub bricks: Vec<BrickRecord>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl SnapVolume {
    /// A snapshot volume with no bricks or options.
    pub fn named(volname: impl Into<String>, snapname: impl Into<String>, volume_id: Uuid) -> Self {
        Self {
            volname: volname.into(),
            volume_id,
            snapname: snapname.into(),
            parent_volname: String::new(),
            kind: VolumeKind::Snapshot,
            bricks: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == VolumeKind::Snapshot
    }

    /// Backend name forced through the volume options, if any.
    pub fn forced_backend(&self) -> Option<&str> {
        self.options
            .get(BACKEND_OPTION)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// Kind of cluster-wide snapshot operation a brick missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapOpKind {
    Create,
    Delete,
}

impl Display for SnapOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapOpKind::Create => write!(f, "create"),
            SnapOpKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for SnapOpKind {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(SnapOpKind::Create),
            "delete" | "remove" => Ok(SnapOpKind::Delete),
            _ => Err(SnapshotError::parse(
                "missed operation",
                format!("unknown operation '{}': expected create or delete", s),
            )),
        }
    }
}

/// A snapshot operation that could not reach a brick and awaits replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedSnapOp {
    pub volname: String,
    pub snapname: String,
    /// Node that owns the brick
    pub node_uuid: Uuid,
    /// Origin brick path the snapshot is taken from
    pub brick_path: PathBuf,
    /// 1-based position of the brick in the volume
    pub brick_num: u32,
    pub op: SnapOpKind,
}

impl MissedSnapOp {
    /// 0-based brick index used by the device namers.
    pub fn brick_index(&self) -> Result<u32> {
        self.brick_num.checked_sub(1).ok_or_else(|| {
            SnapshotError::parse("missed operation", "brick number must start at 1")
        })
    }
}
