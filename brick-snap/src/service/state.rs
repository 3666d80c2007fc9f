//! JSON state file holding snapshot volumes and pending missed operations.

use std::io::{self, ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::snapshot::BrickReport;
use crate::brick::{MissedSnapOp, SnapVolume};
use crate::error::{Result, SnapshotError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapState {
    #[serde(default)]
    pub volumes: Vec<SnapVolume>,
    /// Operations waiting to be replayed on this node
    #[serde(default)]
    pub missed: Vec<MissedSnapOp>,
}

impl SnapState {
    /// Load the state file; a missing file is an empty state.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let state: SnapState = serde_json::from_slice(&bytes)?;
                debug!(
                    path = %path.display(),
                    volumes = state.volumes.len(),
                    missed = state.missed.len(),
                    "Loaded snapshot state"
                );
                Ok(state)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the state file atomically via a temp file in the same directory.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let target = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let dir = match target.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let mut temp_file = NamedTempFile::new_in(dir)?;
            temp_file.write_all(&json)?;
            temp_file.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;

        debug!(path = %path.display(), "Saved snapshot state");
        Ok(())
    }

    pub fn volume(&self, volname: &str) -> Result<&SnapVolume> {
        self.volumes
            .iter()
            .find(|vol| vol.volname == volname)
            .ok_or_else(|| SnapshotError::VolumeNotFound(volname.to_string()))
    }

    pub fn volume_mut(&mut self, volname: &str) -> Result<&mut SnapVolume> {
        self.volumes
            .iter_mut()
            .find(|vol| vol.volname == volname)
            .ok_or_else(|| SnapshotError::VolumeNotFound(volname.to_string()))
    }

    /// Forget `volname` after a removal, unless a brick may still hold its
    /// snapshot. Returns whether the volume was dropped.
    pub fn settle_removal(&mut self, volname: &str, reports: &[BrickReport]) -> bool {
        if let Some(report) = reports.iter().find(|r| r.leaves_resource()) {
            warn!(
                volume = %volname,
                brick = %report.brick,
                status = %report.status,
                "Keeping snapshot volume in state after incomplete removal"
            );
            return false;
        }
        self.remove_volume(volname).is_some()
    }

    /// Drop a volume, returning it if it was present.
    pub fn remove_volume(&mut self, volname: &str) -> Option<SnapVolume> {
        let index = self.volumes.iter().position(|vol| vol.volname == volname)?;
        Some(self.volumes.remove(index))
    }
}
