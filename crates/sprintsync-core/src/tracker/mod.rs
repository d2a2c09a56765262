//! Issue-tracker adapter interface.
//!
//! The engine talks to a remote tracker only through the [`TrackerClient`]
//! trait. Resources are identified by a natural [`ResourceKey`] (kind plus
//! name or title) rather than a remote-assigned id, which is what makes
//! repeated runs idempotent.
//!
//! ```text
//! synchronize
//!     |
//!     v
//! &dyn TrackerClient
//!     |   exists(key)        -> Option<RemoteRef>
//!     |   create(payload)    -> RemoteRef
//!     |   update(ref, payload)
//!     |   set_board_status(ref, status)
//! ```

pub mod memory;
pub mod trait_def;
pub mod types;

pub use memory::MemoryTracker;
pub use trait_def::TrackerClient;
pub use types::{
    BoardStatus, IssuePayload, LabelPayload, MilestonePayload, RemoteId, RemoteRef, ResourceKey,
    ResourceKind, ResourcePayload, TrackerError,
};
