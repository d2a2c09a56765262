//! In-memory tracker for dry runs and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::trait_def::TrackerClient;
use super::types::{
    BoardStatus, RemoteId, RemoteRef, ResourceKey, ResourceKind, ResourcePayload, TrackerError,
};

#[derive(Debug, Default)]
struct State {
    resources: HashMap<ResourceKey, Stored>,
    created: Vec<ResourceKey>,
    updates: Vec<ResourceKey>,
    board: Vec<(RemoteRef, BoardStatus)>,
    next_number: u64,
}

#[derive(Debug, Clone)]
struct Stored {
    remote: RemoteRef,
    payload: Option<ResourcePayload>,
}

/// A [`TrackerClient`] that keeps everything in a mutex-guarded map.
///
/// Labels are identified by their name; milestones and issues get
/// sequential numbers starting at 1. Creating a label or milestone that
/// already exists returns [`TrackerError::Duplicate`]. Issues, like on a
/// real tracker, can be created twice under the same title; the second
/// creation is still recorded so tests can detect it.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    state: Mutex<State>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the tracker with resources that exist before a run.
    pub fn with_existing(keys: impl IntoIterator<Item = ResourceKey>) -> Self {
        let tracker = Self::new();
        {
            let mut state = tracker.lock();
            for key in keys {
                let id = state.assign_id(&key);
                state.resources.insert(
                    key.clone(),
                    Stored {
                        remote: RemoteRef { key, id },
                        payload: None,
                    },
                );
            }
        }
        tracker
    }

    /// Keys in the order they were created through [`TrackerClient::create`].
    pub fn creation_log(&self) -> Vec<ResourceKey> {
        self.lock().created.clone()
    }

    /// How many times `key` was created.
    pub fn count_created(&self, key: &ResourceKey) -> usize {
        self.lock().created.iter().filter(|k| *k == key).count()
    }

    /// Keys whose content was replaced through [`TrackerClient::update`].
    pub fn update_log(&self) -> Vec<ResourceKey> {
        self.lock().updates.clone()
    }

    /// Current body of an issue, if the tracker holds its payload.
    pub fn issue_body(&self, title: &str) -> Option<String> {
        let state = self.lock();
        match state.resources.get(&ResourceKey::issue(title))?.payload.as_ref()? {
            ResourcePayload::Issue(issue) => Some(issue.body.clone()),
            _ => None,
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<RemoteRef> {
        self.lock().resources.get(key).map(|s| s.remote.clone())
    }

    pub fn payload(&self, key: &ResourceKey) -> Option<ResourcePayload> {
        self.lock().resources.get(key)?.payload.clone()
    }

    /// Board placements in call order.
    pub fn board_items(&self) -> Vec<(RemoteRef, BoardStatus)> {
        self.lock().board.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().resources.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    fn assign_id(&mut self, key: &ResourceKey) -> RemoteId {
        match key.kind {
            ResourceKind::Label => RemoteId(key.name.clone()),
            ResourceKind::Milestone | ResourceKind::Issue => {
                self.next_number += 1;
                RemoteId(self.next_number.to_string())
            }
        }
    }
}

#[async_trait]
impl TrackerClient for MemoryTracker {
    async fn exists(&self, key: &ResourceKey) -> Result<Option<RemoteRef>, TrackerError> {
        Ok(self.get(key))
    }

    async fn create(&self, payload: &ResourcePayload) -> Result<RemoteRef, TrackerError> {
        let key = payload.key();
        let mut state = self.lock();
        if key.kind != ResourceKind::Issue && state.resources.contains_key(&key) {
            return Err(TrackerError::Duplicate);
        }
        let id = state.assign_id(&key);
        let remote = RemoteRef {
            key: key.clone(),
            id,
        };
        if state.resources.contains_key(&key) {
            tracing::warn!(key = %key, "memory tracker: duplicate issue title created");
        }
        state.resources.insert(
            key.clone(),
            Stored {
                remote: remote.clone(),
                payload: Some(payload.clone()),
            },
        );
        state.created.push(key);
        Ok(remote)
    }

    async fn update(
        &self,
        remote: &RemoteRef,
        payload: &ResourcePayload,
    ) -> Result<(), TrackerError> {
        let mut state = self.lock();
        let Some(stored) = state.resources.get_mut(&remote.key) else {
            return Err(TrackerError::Unknown(format!("{} not found", remote.key)));
        };
        stored.payload = Some(payload.clone());
        state.updates.push(remote.key.clone());
        Ok(())
    }

    async fn set_board_status(
        &self,
        remote: &RemoteRef,
        status: BoardStatus,
    ) -> Result<(), TrackerError> {
        self.lock().board.push((remote.clone(), status));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::types::{IssuePayload, LabelPayload};

    fn label(name: &str) -> ResourcePayload {
        ResourcePayload::Label(LabelPayload {
            name: name.into(),
            color: None,
            description: None,
        })
    }

    fn issue(title: &str, body: &str) -> ResourcePayload {
        ResourcePayload::Issue(IssuePayload {
            title: title.into(),
            body: body.into(),
            labels: vec![],
            milestone: None,
        })
    }

    #[tokio::test]
    async fn create_then_exists() {
        let tracker = MemoryTracker::new();
        let remote = tracker.create(&issue("[0.1] Setup", "body")).await.unwrap();
        assert_eq!(remote.id, RemoteId::from("1"));
        assert_eq!(
            tracker.exists(&ResourceKey::issue("[0.1] Setup")).await.unwrap(),
            Some(remote)
        );
        assert_eq!(tracker.issue_body("[0.1] Setup").as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn duplicate_label_is_rejected() {
        let tracker = MemoryTracker::new();
        let remote = tracker.create(&label("sprint-0")).await.unwrap();
        assert_eq!(remote.id, RemoteId::from("sprint-0"));
        assert_eq!(
            tracker.create(&label("sprint-0")).await.unwrap_err(),
            TrackerError::Duplicate
        );
        assert_eq!(tracker.count_created(&ResourceKey::label("sprint-0")), 1);
    }

    #[tokio::test]
    async fn duplicate_issue_is_recorded() {
        let tracker = MemoryTracker::new();
        tracker.create(&issue("[0.1] Setup", "a")).await.unwrap();
        tracker.create(&issue("[0.1] Setup", "b")).await.unwrap();
        assert_eq!(tracker.count_created(&ResourceKey::issue("[0.1] Setup")), 2);
    }

    #[tokio::test]
    async fn update_replaces_body_and_board_is_logged() {
        let tracker = MemoryTracker::new();
        let remote = tracker.create(&issue("[0.1] Setup", "old")).await.unwrap();
        tracker.update(&remote, &issue("[0.1] Setup", "new")).await.unwrap();
        tracker
            .set_board_status(&remote, BoardStatus::Todo)
            .await
            .unwrap();
        assert_eq!(tracker.issue_body("[0.1] Setup").as_deref(), Some("new"));
        assert_eq!(tracker.update_log(), vec![remote.key.clone()]);
        assert_eq!(tracker.board_items(), vec![(remote, BoardStatus::Todo)]);
    }

    #[tokio::test]
    async fn update_of_missing_resource_fails() {
        let tracker = MemoryTracker::new();
        let remote = RemoteRef {
            key: ResourceKey::issue("ghost"),
            id: RemoteId::from("9"),
        };
        assert!(matches!(
            tracker.update(&remote, &issue("ghost", "")).await,
            Err(TrackerError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn seeded_resources_exist_without_creation() {
        let tracker = MemoryTracker::with_existing([ResourceKey::milestone("Sprint 0: A")]);
        assert!(tracker
            .exists(&ResourceKey::milestone("Sprint 0: A"))
            .await
            .unwrap()
            .is_some());
        assert!(tracker.creation_log().is_empty());
        assert_eq!(tracker.len(), 1);
    }
}
