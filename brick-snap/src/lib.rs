//! Brick Snapshot Library
//!
//! This library provides copy-on-write snapshot management for storage
//! bricks on LVM thin volumes, Btrfs subvolumes and ZFS datasets.
//!
//! The library is split into several modules:
//! - `backend`: the `SnapshotBackend` trait, the three backends and backend selection
//! - `brick`: brick, snapshot volume and missed operation records
//! - `context`: per-call context (command runner, mount helper, node identity, config)
//! - `exec`: native command execution
//! - `host`: mount table lookups, unmounting and brick process control
//! - `fakes`: in-memory host services for tests (`testing` feature)
//! - `service`: per-node fan-out of backend operations over a state file
//! - `metrics`: Prometheus metrics collection

pub mod backend;
pub mod brick;
pub mod context;
pub mod error;
pub mod exec;
#[cfg(any(test, feature = "testing"))]
pub mod fakes;
pub mod host;
pub mod metrics;
pub mod service;

pub use backend::{
    BackendKind, BtrfsBackend, LvmBackend, RemoveOutcome, SnapshotBackend, ZfsBackend,
    select_backend,
};
pub use brick::{BrickRecord, BrickStatus, MissedSnapOp, SnapOpKind, SnapVolume};
pub use context::{NodeIdentity, RetryPolicy, SnapConfig, SnapContext};
pub use error::{Result, SnapshotError};
pub use service::{SnapState, SnapshotService};
