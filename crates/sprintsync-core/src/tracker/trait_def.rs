//! The `TrackerClient` trait -- the adapter interface for issue trackers.
//!
//! The trait is object-safe so the engine can hold an
//! `Arc<dyn TrackerClient>` shared across worker tasks.

use async_trait::async_trait;

use super::types::{BoardStatus, RemoteRef, ResourceKey, ResourcePayload, TrackerError};

/// Remote operations the synchronizer needs from a tracker.
///
/// Implementations must be safe for concurrent use; the engine issues
/// calls from several workers at once.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Look a resource up by its natural key.
    ///
    /// Labels match by name, milestones by title, issues by exact title.
    async fn exists(&self, key: &ResourceKey) -> Result<Option<RemoteRef>, TrackerError>;

    /// Create a resource. Returns [`TrackerError::Duplicate`] if the
    /// tracker already holds one under the same key.
    async fn create(&self, payload: &ResourcePayload) -> Result<RemoteRef, TrackerError>;

    /// Replace the mutable content (issue body) of an existing resource.
    async fn update(
        &self,
        remote: &RemoteRef,
        payload: &ResourcePayload,
    ) -> Result<(), TrackerError>;

    /// Place an issue on the project board. Trackers without a board
    /// accept every call.
    async fn set_board_status(
        &self,
        _remote: &RemoteRef,
        _status: BoardStatus,
    ) -> Result<(), TrackerError> {
        Ok(())
    }
}

// Compile-time assertion: TrackerClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TrackerClient) {}
};
