use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("command '{0}' is not available on this host")]
    ToolUnavailable(String),

    #[error("command [{command}] failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to parse {tool} output: {detail}")]
    ParseError { tool: String, detail: String },

    #[error("invalid snapshot name: {0}")]
    InvalidName(String),

    #[error("device '{0}' is not a thinly provisioned logical volume")]
    NotThinProvisioned(String),

    #[error("could not resolve the mount root of '{}'", .0.display())]
    BrickRoot(PathBuf),

    #[error("no mount table entry for '{}'", .0.display())]
    MountEntryNotFound(PathBuf),

    #[error("brick '{0}' has no subvolume in its mount options")]
    MissingSubvolume(String),

    #[error("malformed snapshot identifier '{0}'")]
    InvalidDevice(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("unknown snapshot backend '{0}'")]
    UnknownBackend(String),

    #[error("brick '{0}' has no origin brick recorded")]
    MissingOrigin(String),

    #[error("snapshot volume '{0}' not found")]
    VolumeNotFound(String),

    #[error("snapshot volume '{volume}' has no brick {brick_num}")]
    BrickNotFound { volume: String, brick_num: u32 },

    #[error("state file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    pub(crate) fn parse(tool: &str, detail: impl Into<String>) -> Self {
        SnapshotError::ParseError {
            tool: tool.to_string(),
            detail: detail.into(),
        }
    }

    /// Short label used for metrics and CLI summaries.
    pub fn code(&self) -> &'static str {
        match self {
            SnapshotError::ToolUnavailable(_) => "tool_unavailable",
            SnapshotError::CommandFailed { .. } => "command_failed",
            SnapshotError::ParseError { .. } => "parse_error",
            SnapshotError::InvalidName(_) => "invalid_name",
            SnapshotError::NotThinProvisioned(_) => "not_thin",
            SnapshotError::BrickRoot(_) => "brick_root",
            SnapshotError::MountEntryNotFound(_) => "mount_entry",
            SnapshotError::MissingSubvolume(_) => "missing_subvolume",
            SnapshotError::InvalidDevice(_) => "invalid_device",
            SnapshotError::Unsupported { .. } => "unsupported",
            SnapshotError::UnknownBackend(_) => "unknown_backend",
            SnapshotError::MissingOrigin(_) => "missing_origin",
            SnapshotError::VolumeNotFound(_) => "volume_not_found",
            SnapshotError::BrickNotFound { .. } => "brick_not_found",
            SnapshotError::Json(_) => "state",
            SnapshotError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
