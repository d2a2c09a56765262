//! Remote state snapshot and the in-run claim ledger.
//!
//! [`fetch_existing`] looks every desired key up before any mutating call.
//! [`SnapshotLedger`] then wraps the result so that workers claim a key
//! before creating it; a key that is known to exist, was created in this
//! run, or is currently being created by another worker cannot be claimed
//! twice. A key whose lookup failed is never claimed for creation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::retry::{RetryPolicy, execute_with_retry};
use crate::tracker::{RemoteRef, ResourceKey, TrackerClient, TrackerError};

/// Resources observed to exist remotely, keyed by natural key, plus the
/// keys whose existence could not be determined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    existing: BTreeMap<ResourceKey, RemoteRef>,
    unverified: BTreeMap<ResourceKey, String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, remote: RemoteRef) {
        self.existing.insert(remote.key.clone(), remote);
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&RemoteRef> {
        self.existing.get(key)
    }

    pub fn mark_unverified(&mut self, key: ResourceKey, reason: impl Into<String>) {
        self.unverified.insert(key, reason.into());
    }

    /// Why the lookup for `key` failed, if it did.
    pub fn unverified(&self, key: &ResourceKey) -> Option<&str> {
        self.unverified.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.existing.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.existing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.existing.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteRef> {
        self.existing.values()
    }
}

impl FromIterator<RemoteRef> for Snapshot {
    fn from_iter<I: IntoIterator<Item = RemoteRef>>(iter: I) -> Self {
        let mut snapshot = Self::new();
        for remote in iter {
            snapshot.insert(remote);
        }
        snapshot
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Maximum lookups in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("authentication failed while looking up {key}: {message}")]
    AuthFailed { key: ResourceKey, message: String },
}

/// Look up every key on the tracker.
///
/// A lookup that still fails after retries is logged and the key is
/// marked unverified; the reconciler fails it instead of risking a
/// duplicate. An authentication failure aborts the whole fetch.
pub async fn fetch_existing(
    tracker: &dyn TrackerClient,
    keys: impl IntoIterator<Item = ResourceKey>,
    options: &SnapshotOptions,
) -> Result<Snapshot, SnapshotError> {
    let never = CancellationToken::new();
    let never = &never;
    let mut lookups = futures::stream::iter(keys.into_iter().map(|key| async move {
        let attempted =
            execute_with_retry(&options.retry, never, None, || tracker.exists(&key)).await;
        (key, attempted.result)
    }))
    .buffer_unordered(options.concurrency.max(1));

    let mut snapshot = Snapshot::new();
    while let Some((key, result)) = lookups.next().await {
        match result {
            Ok(Some(remote)) => {
                tracing::debug!(key = %key, id = %remote.id, "resource exists remotely");
                snapshot.insert(remote);
            }
            Ok(None) => {}
            Err(TrackerError::AuthFailed(message)) => {
                tracing::error!(key = %key, %message, "authentication failed during snapshot");
                return Err(SnapshotError::AuthFailed { key, message });
            }
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "lookup failed; existence unknown");
                snapshot.mark_unverified(key, error.to_string());
            }
        }
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEntry {
    /// Existed before this run. The remote id is unknown when existence was
    /// only inferred from a `Duplicate` response.
    Existing(Option<RemoteRef>),
    /// Claimed by a worker that is creating it right now.
    InFlight,
    Created(RemoteRef),
    /// Lookup failed; holds the lookup error.
    Unverified(String),
}

impl LedgerEntry {
    pub fn remote(&self) -> Option<&RemoteRef> {
        match self {
            Self::Existing(remote) => remote.as_ref(),
            Self::Created(remote) => Some(remote),
            Self::InFlight | Self::Unverified(_) => None,
        }
    }
}

/// Outcome of [`SnapshotLedger::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns creation of the key and must finish with
    /// `record_created`, `record_existing`, or `release`.
    Granted,
    /// The key already exists or was created.
    Known(Option<RemoteRef>),
    /// Another worker holds the claim.
    Busy,
    /// Existence could not be determined; creating could duplicate.
    Unverified(String),
}

/// Mutex-guarded view of the snapshot plus in-run claims and creations.
///
/// One ledger may be shared by several concurrent runs.
#[derive(Debug, Default)]
pub struct SnapshotLedger {
    entries: Mutex<HashMap<ResourceKey, LedgerEntry>>,
    changed: Notify,
}

impl SnapshotLedger {
    pub fn new(snapshot: Snapshot) -> Self {
        let ledger = Self::default();
        ledger.absorb(snapshot);
        ledger
    }

    /// Add snapshot entries for keys the ledger does not know yet.
    pub fn absorb(&self, snapshot: Snapshot) {
        let mut entries = self.lock();
        for (key, remote) in snapshot.existing {
            entries
                .entry(key)
                .or_insert(LedgerEntry::Existing(Some(remote)));
        }
        for (key, reason) in snapshot.unverified {
            entries
                .entry(key)
                .or_insert(LedgerEntry::Unverified(reason));
        }
    }

    pub fn claim(&self, key: &ResourceKey) -> Claim {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(LedgerEntry::InFlight) => Claim::Busy,
            Some(LedgerEntry::Unverified(reason)) => Claim::Unverified(reason.clone()),
            Some(entry) => Claim::Known(entry.remote().cloned()),
            None => {
                entries.insert(key.clone(), LedgerEntry::InFlight);
                Claim::Granted
            }
        }
    }

    /// Claim `key`, waiting while another worker holds it.
    ///
    /// Returns `None` if `cancel` fires first. Never returns
    /// [`Claim::Busy`].
    pub async fn claim_or_wait(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> Option<Claim> {
        loop {
            // Register for wakeups before checking so a release between the
            // check and the wait is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim(key) {
                Claim::Busy => {}
                other => return Some(other),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub fn record_created(&self, remote: RemoteRef) {
        self.lock()
            .insert(remote.key.clone(), LedgerEntry::Created(remote));
        self.changed.notify_waiters();
    }

    pub fn record_existing(&self, key: ResourceKey, remote: Option<RemoteRef>) {
        self.lock().insert(key, LedgerEntry::Existing(remote));
        self.changed.notify_waiters();
    }

    /// Drop a claim after a failed creation so the key can be retried.
    pub fn release(&self, key: &ResourceKey) {
        {
            let mut entries = self.lock();
            if entries.get(key) == Some(&LedgerEntry::InFlight) {
                entries.remove(key);
            }
        }
        self.changed.notify_waiters();
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<LedgerEntry> {
        self.lock().get(key).cloned()
    }

    /// Remote reference for a key that exists or was created, if known.
    pub fn remote(&self, key: &ResourceKey) -> Option<RemoteRef> {
        self.lock().get(key)?.remote().cloned()
    }

    /// Lookup error for a key whose existence is unknown.
    pub fn unverified(&self, key: &ResourceKey) -> Option<String> {
        match self.lock().get(key)? {
            LedgerEntry::Unverified(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Whether the key exists remotely, as far as this ledger knows.
    pub fn is_present(&self, key: &ResourceKey) -> bool {
        matches!(
            self.lock().get(key),
            Some(LedgerEntry::Existing(_) | LedgerEntry::Created(_))
        )
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::tracker::{MemoryTracker, RemoteId};

    fn remote(key: ResourceKey, id: &str) -> RemoteRef {
        RemoteRef {
            key,
            id: RemoteId::from(id),
        }
    }

    #[tokio::test]
    async fn fetch_existing_reports_only_present_keys() {
        let tracker = MemoryTracker::with_existing([ResourceKey::label("sprint-0")]);
        let snapshot = fetch_existing(
            &tracker,
            [ResourceKey::label("sprint-0"), ResourceKey::label("sprint-1")],
            &SnapshotOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&ResourceKey::label("sprint-0")));
    }

    /// Every lookup times out.
    struct UnreachableTracker;

    #[async_trait::async_trait]
    impl TrackerClient for UnreachableTracker {
        async fn exists(&self, _key: &ResourceKey) -> Result<Option<RemoteRef>, TrackerError> {
            Err(TrackerError::Unknown("timeout".into()))
        }

        async fn create(
            &self,
            _payload: &crate::tracker::ResourcePayload,
        ) -> Result<RemoteRef, TrackerError> {
            Err(TrackerError::Unknown("unreachable".into()))
        }

        async fn update(
            &self,
            _remote: &RemoteRef,
            _payload: &crate::tracker::ResourcePayload,
        ) -> Result<(), TrackerError> {
            Err(TrackerError::Unknown("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn failed_lookup_is_unverified_not_absent() {
        let key = ResourceKey::issue("[0.1] A");
        let options = SnapshotOptions {
            concurrency: 1,
            retry: RetryPolicy::immediate(),
        };
        let snapshot = fetch_existing(&UnreachableTracker, [key.clone()], &options)
            .await
            .unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.unverified(&key).is_some());

        let ledger = SnapshotLedger::new(snapshot);
        assert!(!ledger.is_present(&key));
        assert!(matches!(ledger.claim(&key), Claim::Unverified(_)));
    }

    #[test]
    fn claim_is_exclusive() {
        let ledger = SnapshotLedger::default();
        let key = ResourceKey::issue("[0.1] A");
        assert_eq!(ledger.claim(&key), Claim::Granted);
        assert_eq!(ledger.claim(&key), Claim::Busy);

        let created = remote(key.clone(), "7");
        ledger.record_created(created.clone());
        assert_eq!(ledger.claim(&key), Claim::Known(Some(created)));
        assert!(ledger.is_present(&key));
    }

    #[test]
    fn snapshot_entries_are_known() {
        let key = ResourceKey::milestone("Sprint 0: A");
        let ledger = SnapshotLedger::new(Snapshot::from_iter([remote(key.clone(), "1")]));
        assert_eq!(ledger.claim(&key), Claim::Known(Some(remote(key, "1"))));
    }

    #[test]
    fn release_allows_reclaim() {
        let ledger = SnapshotLedger::default();
        let key = ResourceKey::label("x");
        assert_eq!(ledger.claim(&key), Claim::Granted);
        ledger.release(&key);
        assert_eq!(ledger.lookup(&key), None);
        assert_eq!(ledger.claim(&key), Claim::Granted);
    }

    #[test]
    fn absorb_does_not_override_claims() {
        let ledger = SnapshotLedger::default();
        let key = ResourceKey::label("x");
        ledger.claim(&key);
        ledger.absorb(Snapshot::from_iter([remote(key.clone(), "x")]));
        assert_eq!(ledger.lookup(&key), Some(LedgerEntry::InFlight));
    }

    #[tokio::test]
    async fn waiter_wakes_when_claim_resolves() {
        let ledger = Arc::new(SnapshotLedger::default());
        let key = ResourceKey::issue("[0.1] A");
        assert_eq!(ledger.claim(&key), Claim::Granted);

        let waiter = {
            let ledger = Arc::clone(&ledger);
            let key = key.clone();
            tokio::spawn(async move {
                ledger
                    .claim_or_wait(&key, &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ledger.record_created(remote(key.clone(), "3"));

        let claim = waiter.await.unwrap();
        assert_eq!(claim, Some(Claim::Known(Some(remote(key, "3")))));
    }

    #[tokio::test]
    async fn waiter_stops_on_cancel() {
        let ledger = SnapshotLedger::default();
        let key = ResourceKey::label("busy");
        ledger.claim(&key);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(ledger.claim_or_wait(&key, &cancel).await, None);
    }
}
