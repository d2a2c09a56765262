//! Shared test utilities for sprintsync integration tests.
//!
//! Provides a [`ScriptedTracker`] that wraps the in-memory tracker with
//! per-key fault scripts, call counting, and optional latency, a
//! [`CancelOnCreate`] wrapper for cancellation tests, and plan fixtures.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sprintsync_core::config::{RetrySettings, SyncConfig};
use sprintsync_core::plan::{Plan, parse};
use sprintsync_core::tracker::{
    BoardStatus, MemoryTracker, RemoteRef, ResourceKey, ResourcePayload, TrackerClient,
    TrackerError,
};

/// Tracker operation, for fault scripts and call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Exists,
    Create,
    Update,
    Board,
}

#[derive(Debug, Default)]
struct Script {
    by_key: HashMap<(Op, ResourceKey), VecDeque<TrackerError>>,
    any_key: HashMap<Op, VecDeque<TrackerError>>,
    calls: HashMap<(Op, ResourceKey), u32>,
}

/// [`MemoryTracker`] with scripted failures.
///
/// Each call first consumes a scripted error for its `(op, key)` pair, then
/// one for its op on any key; with no script left it delegates to the
/// inner tracker.
#[derive(Debug, Default)]
pub struct ScriptedTracker {
    inner: MemoryTracker,
    script: Mutex<Script>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrapping(inner: MemoryTracker) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue errors returned by the next calls of `op` on `key`.
    pub fn fail(&self, op: Op, key: ResourceKey, errors: impl IntoIterator<Item = TrackerError>) {
        self.lock()
            .by_key
            .entry((op, key))
            .or_default()
            .extend(errors);
    }

    /// Queue errors returned by the next calls of `op` on any key.
    pub fn fail_any(&self, op: Op, errors: impl IntoIterator<Item = TrackerError>) {
        self.lock().any_key.entry(op).or_default().extend(errors);
    }

    pub fn calls(&self, op: Op, key: &ResourceKey) -> u32 {
        self.lock()
            .calls
            .get(&(op, key.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self, op: Op) -> u32 {
        self.lock()
            .calls
            .iter()
            .filter(|((o, _), _)| *o == op)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryTracker {
        &self.inner
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, op: Op, key: &ResourceKey) -> Result<(), TrackerError> {
        let fault = {
            let mut script = self.lock();
            *script.calls.entry((op, key.clone())).or_default() += 1;
            let keyed = script
                .by_key
                .get_mut(&(op, key.clone()))
                .and_then(VecDeque::pop_front);
            keyed.or_else(|| script.any_key.get_mut(&op).and_then(VecDeque::pop_front))
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrackerClient for ScriptedTracker {
    async fn exists(&self, key: &ResourceKey) -> Result<Option<RemoteRef>, TrackerError> {
        self.enter(Op::Exists, key).await?;
        self.inner.exists(key).await
    }

    async fn create(&self, payload: &ResourcePayload) -> Result<RemoteRef, TrackerError> {
        self.enter(Op::Create, &payload.key()).await?;
        self.inner.create(payload).await
    }

    async fn update(
        &self,
        remote: &RemoteRef,
        payload: &ResourcePayload,
    ) -> Result<(), TrackerError> {
        self.enter(Op::Update, &remote.key).await?;
        self.inner.update(remote, payload).await
    }

    async fn set_board_status(
        &self,
        remote: &RemoteRef,
        status: BoardStatus,
    ) -> Result<(), TrackerError> {
        self.enter(Op::Board, &remote.key).await?;
        self.inner.set_board_status(remote, status).await
    }
}

/// Cancels `token` when the `after`-th create call starts. The call itself
/// still completes.
pub struct CancelOnCreate {
    inner: Arc<dyn TrackerClient>,
    token: CancellationToken,
    after: usize,
    creates: AtomicUsize,
}

impl CancelOnCreate {
    pub fn new(inner: Arc<dyn TrackerClient>, token: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after,
            creates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TrackerClient for CancelOnCreate {
    async fn exists(&self, key: &ResourceKey) -> Result<Option<RemoteRef>, TrackerError> {
        self.inner.exists(key).await
    }

    async fn create(&self, payload: &ResourcePayload) -> Result<RemoteRef, TrackerError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.after {
            self.token.cancel();
        }
        self.inner.create(payload).await
    }

    async fn update(
        &self,
        remote: &RemoteRef,
        payload: &ResourcePayload,
    ) -> Result<(), TrackerError> {
        self.inner.update(remote, payload).await
    }

    async fn set_board_status(
        &self,
        remote: &RemoteRef,
        status: BoardStatus,
    ) -> Result<(), TrackerError> {
        self.inner.set_board_status(remote, status).await
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Sprint 0 with two tasks, Sprint 1 with one: nine desired resources
/// without category labels.
pub const TWO_SPRINT_PLAN: &str = "\
# Platform Launch

## Sprint 0: Foundation (Week 1)

Lay the groundwork.

1. **Create repository** - workspace layout and tooling
   - add README
   - configure formatter
2. **Set up CI** - run tests on every push

### Sprint Acceptance Criteria
- [ ] main branch builds

### Gate
- [ ] foundation reviewed

## Sprint 1: Core (Week 2)

### Task 1.1: Sync engine
Implement the reconciler.

### Acceptance Criteria
- [ ] idempotent re-runs

### Gate
- [ ] demo recorded
";

pub fn two_sprint_plan() -> Plan {
    parse(TWO_SPRINT_PLAN).expect("fixture plan should parse")
}

/// Generate a plan with `sprints` sprints of `tasks` numbered tasks each.
pub fn generated_plan_text(sprints: u32, tasks: u32) -> String {
    let mut text = String::from("# Generated Plan\n\n");
    for s in 0..sprints {
        let _ = writeln!(text, "## Sprint {s}: Stage {s}\n");
        for t in 1..=tasks {
            let _ = writeln!(text, "{t}. **Work item {s}.{t}** - generated task");
        }
        let _ = writeln!(text, "\n### Acceptance Criteria\n- [ ] stage {s} done\n");
        let _ = writeln!(text, "### Gate\n- [ ] stage {s} reviewed\n");
    }
    text
}

pub fn generated_plan(sprints: u32, tasks: u32) -> Plan {
    parse(&generated_plan_text(sprints, tasks)).expect("generated plan should parse")
}

/// Config with no pacing and no backoff delay.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        organization: "acme".into(),
        repository: "roadmap".into(),
        pacing_ms: 0,
        retry: RetrySettings {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
            ..RetrySettings::default()
        },
        ..SyncConfig::default()
    }
}
