//! Plan-to-resource synchronization engine.
//!
//! Turns a sprint planning document into a validated [`plan::Plan`], orders
//! its tasks and gates with [`graph::resolve`], and reconciles the derived
//! labels, milestones, and issues against an issue tracker through the
//! [`tracker::TrackerClient`] contract without ever creating duplicates.

pub mod config;
pub mod graph;
pub mod plan;
pub mod report;
pub mod retry;
pub mod snapshot;
pub mod sync;
pub mod tracker;

pub use config::{SyncConfig, SprintRange};
pub use graph::{DependencyGraph, ResolveError, resolve};
pub use plan::{NodeId, ParseError, Plan, parse};
pub use report::{Summary, summarize};
pub use snapshot::{Snapshot, SnapshotLedger, fetch_existing};
pub use sync::{SyncReport, run_sync, synchronize};
pub use tracker::{MemoryTracker, TrackerClient, TrackerError};
