//! Node-level orchestration over the snapshot backends.

pub mod snapshot;
pub mod state;

pub use snapshot::{BrickReport, DEFAULT_MAX_CONCURRENT_OPS, ProbeReport, SnapshotService};
pub use state::SnapState;
