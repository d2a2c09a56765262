//! Reconciliation of a plan against a tracker.
//!
//! A run derives the desired resources from the plan, answers every key
//! the ledger already knows with `AlreadyExists`, and creates the rest in
//! three phases:
//!
//! 1. labels and milestones
//! 2. task and gate issues, queued in topological order
//! 3. finishing: resolve cross references in the bodies of issues created
//!    by this run and place them on the board
//!
//! Every phase runs one worker pool per sprint partition. Failures stay
//! isolated to their resource; only an authentication failure aborts the
//! run, and external cancellation stops scheduling without interrupting
//! calls already in flight.

pub mod desired;
pub mod links;
pub mod pacing;
mod pool;
pub mod result;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ConfigError, SyncConfig};
use crate::graph::{DependencyGraph, ResolveError, resolve};
use crate::plan::Plan;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::snapshot::{Claim, SnapshotError, SnapshotLedger, SnapshotOptions, fetch_existing};
use crate::tracker::{
    BoardStatus, RemoteRef, ResourceKey, ResourceKind, ResourcePayload, TrackerClient,
    TrackerError,
};

use desired::{DesiredResource, issue_key_for};
use links::{Reference, render_issue_body};
use pacing::Pacer;
use pool::{JobHandler, PoolSettings, run_phase};
use state::{ResourceState, Tracked};

pub use desired::derive;
pub use result::{
    AbortReason, LinkOutcome, LinkResult, LinkStep, NotAttempted, Outcome, ReconciliationResult,
    SyncReport,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Resolve, snapshot, and synchronize `plan` in one call.
///
/// An authentication failure during the snapshot yields a report with
/// every resource not attempted and no mutation issued.
pub async fn run_sync(
    plan: &Plan,
    tracker: Arc<dyn TrackerClient>,
    config: &SyncConfig,
    cancel: CancellationToken,
) -> Result<SyncReport, SyncError> {
    config.validate()?;
    let graph = resolve(plan)?;
    let desired = derive(plan, &graph, config);
    let started_at = Utc::now();

    let options = SnapshotOptions {
        concurrency: config.worker_count(),
        retry: config.retry.policy(),
    };
    let keys: Vec<ResourceKey> = desired.iter().map(|d| d.key.clone()).collect();
    let snapshot = tokio::select! {
        snapshot = fetch_existing(tracker.as_ref(), keys, &options) => snapshot,
        _ = cancel.cancelled() => {
            tracing::info!("cancelled during snapshot");
            return Ok(unattempted_report(plan, &desired, started_at, AbortReason::Cancelled));
        }
    };

    match snapshot {
        Ok(snapshot) => {
            tracing::info!(
                desired = desired.len(),
                existing = snapshot.len(),
                "snapshot complete"
            );
            let ledger = Arc::new(SnapshotLedger::new(snapshot));
            synchronize(plan, &graph, ledger, tracker, config, cancel).await
        }
        Err(SnapshotError::AuthFailed { key, message }) => Ok(unattempted_report(
            plan,
            &desired,
            started_at,
            AbortReason::AuthFailed { key, message },
        )),
    }
}

/// Reconcile `plan` against `tracker`, using `ledger` as the known remote
/// state. Several runs may share one ledger.
pub async fn synchronize(
    plan: &Plan,
    graph: &DependencyGraph,
    ledger: Arc<SnapshotLedger>,
    tracker: Arc<dyn TrackerClient>,
    config: &SyncConfig,
    cancel: CancellationToken,
) -> Result<SyncReport, SyncError> {
    config.validate()?;
    let desired = derive(plan, graph, config);
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("sync", run_id = %run_id);
    let report = execute(Run {
        run_id,
        plan,
        desired,
        ledger,
        tracker,
        config,
        cancel,
    })
    .instrument(span)
    .await;
    Ok(report)
}

struct Run<'a> {
    run_id: Uuid,
    plan: &'a Plan,
    desired: Vec<DesiredResource>,
    ledger: Arc<SnapshotLedger>,
    tracker: Arc<dyn TrackerClient>,
    config: &'a SyncConfig,
    cancel: CancellationToken,
}

async fn execute(run: Run<'_>) -> SyncReport {
    let Run {
        run_id,
        plan,
        desired,
        ledger,
        tracker,
        config,
        cancel,
    } = run;
    let started_at = Utc::now();
    tracing::info!(
        resources = desired.len(),
        concurrency = config.worker_count(),
        partitions = config.partitions,
        "sync started"
    );

    let order: HashMap<ResourceKey, usize> = desired
        .iter()
        .enumerate()
        .map(|(i, d)| (d.key.clone(), i))
        .collect();
    let partitioner = Partitioner::new(
        plan.sprints
            .iter()
            .map(|s| s.number)
            .filter(|n| config.includes_sprint(*n)),
        config.partitions,
    );

    let mut results = Vec::with_capacity(desired.len());
    let mut not_attempted = Vec::new();
    let mut structural = Vec::new();
    let mut issues = Vec::new();
    for resource in desired {
        if ledger.is_present(&resource.key) {
            tracing::debug!(key = %resource.key, "already exists");
            results.push(reconciled(
                &resource,
                Outcome::AlreadyExists,
                ledger.remote(&resource.key),
                0,
            ));
        } else if let Some(reason) = ledger.unverified(&resource.key) {
            tracing::warn!(key = %resource.key, %reason, "existence unknown; not creating");
            results.push(reconciled(&resource, unverified(&reason), None, 0));
        } else if resource.kind() == ResourceKind::Issue {
            issues.push(resource);
        } else {
            structural.push(resource);
        }
    }
    let issue_specs: HashMap<ResourceKey, DesiredResource> = issues
        .iter()
        .map(|d| (d.key.clone(), d.clone()))
        .collect();

    let ctx = Arc::new(RunContext {
        tracker,
        ledger,
        policy: config.retry.policy(),
        abort: cancel.child_token(),
        abort_reason: Mutex::new(None),
    });
    let settings = PoolSettings {
        workers: config.worker_count(),
        pacing: config.pacing(),
    };
    let creator = Arc::new(Creator {
        ctx: Arc::clone(&ctx),
    });

    for (phase, jobs) in [(1u8, structural), (2u8, issues)] {
        if jobs.is_empty() {
            continue;
        }
        if ctx.abort.is_cancelled() {
            not_attempted.extend(jobs.iter().map(skipped));
            continue;
        }
        tracing::info!(phase, jobs = jobs.len(), "phase started");
        let buckets = partitioner.split(jobs, |d| d.sprint);
        let out = run_phase(Arc::clone(&creator), buckets, settings, &ctx.abort).await;
        for output in out.outputs {
            match output {
                CreateOutput::Finished(result) => results.push(result),
                CreateOutput::NotAttempted(entry) => not_attempted.push(entry),
            }
        }
        not_attempted.extend(out.skipped.iter().map(skipped));
    }

    let mut links = Vec::new();
    if ctx.abort.is_cancelled() {
        tracing::info!("skipping finishing pass");
    } else {
        let jobs = finish_jobs(plan, &ctx.ledger, &results, &issue_specs, config.add_to_board);
        if !jobs.is_empty() {
            tracing::info!(phase = 3u8, jobs = jobs.len(), "phase started");
            let finisher = Arc::new(Finisher {
                ctx: Arc::clone(&ctx),
            });
            let buckets = partitioner.split(jobs, |j| j.sprint);
            let out = run_phase(finisher, buckets, settings, &ctx.abort).await;
            links.extend(out.outputs.into_iter().flatten());
            if !out.skipped.is_empty() {
                tracing::warn!(skipped = out.skipped.len(), "finishing pass interrupted");
            }
        }
    }

    let aborted = ctx
        .take_abort_reason()
        .or_else(|| cancel.is_cancelled().then_some(AbortReason::Cancelled));

    let rank = |key: &ResourceKey| order.get(key).copied().unwrap_or(usize::MAX);
    results.sort_by_key(|r| rank(&r.key));
    not_attempted.sort_by_key(|n| rank(&n.key));
    links.sort_by_key(|l| (rank(&l.key), l.step as u8));

    let report = SyncReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        plan_fingerprint: plan.fingerprint(),
        results,
        not_attempted,
        links,
        aborted,
    };
    match &report.aborted {
        Some(reason) => tracing::error!(%reason, "sync aborted"),
        None => tracing::info!(
            created = report.created(),
            already_exists = report.already_existing(),
            failed = report.failed(),
            "sync finished"
        ),
    }
    report
}

fn unattempted_report(
    plan: &Plan,
    desired: &[DesiredResource],
    started_at: chrono::DateTime<Utc>,
    reason: AbortReason,
) -> SyncReport {
    tracing::error!(%reason, "sync aborted before any mutation");
    SyncReport {
        run_id: Uuid::new_v4(),
        started_at,
        finished_at: Utc::now(),
        plan_fingerprint: plan.fingerprint(),
        results: Vec::new(),
        not_attempted: desired.iter().map(skipped).collect(),
        links: Vec::new(),
        aborted: Some(reason),
    }
}

fn skipped(resource: &DesiredResource) -> NotAttempted {
    NotAttempted {
        key: resource.key.clone(),
        sprint: resource.sprint,
    }
}

fn reconciled(
    resource: &DesiredResource,
    outcome: Outcome,
    remote: Option<RemoteRef>,
    attempts: u32,
) -> ReconciliationResult {
    ReconciliationResult {
        key: resource.key.clone(),
        sprint: resource.sprint,
        node: resource.node,
        outcome,
        remote,
        attempts,
    }
}

fn unverified(reason: &str) -> Outcome {
    Outcome::Failed {
        reason: format!("existence unknown: {reason}"),
    }
}

fn step(state: &mut Tracked, key: &ResourceKey, to: ResourceState) {
    if let Err(e) = state.advance(to) {
        tracing::error!(key = %key, error = %e, "resource state machine violation");
    }
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Maps sprints onto contiguous partitions of roughly equal size.
#[derive(Debug)]
struct Partitioner {
    of_sprint: HashMap<u32, usize>,
    count: usize,
}

impl Partitioner {
    fn new(sprints: impl Iterator<Item = u32>, partitions: usize) -> Self {
        let mut sprints: Vec<u32> = sprints.collect();
        sprints.sort_unstable();
        let n = sprints.len();
        let size = n.div_ceil(partitions.clamp(1, n.max(1))).max(1);
        let of_sprint = sprints
            .iter()
            .enumerate()
            .map(|(i, s)| (*s, i / size))
            .collect();
        Self {
            of_sprint,
            count: n.div_ceil(size).max(1),
        }
    }

    /// Resources without a sprint belong to the first partition.
    fn index(&self, sprint: Option<u32>) -> usize {
        sprint
            .and_then(|s| self.of_sprint.get(&s))
            .copied()
            .unwrap_or(0)
    }

    fn split<J>(&self, jobs: Vec<J>, sprint_of: impl Fn(&J) -> Option<u32>) -> Vec<Vec<J>> {
        let mut buckets: Vec<Vec<J>> = (0..self.count).map(|_| Vec::new()).collect();
        for job in jobs {
            let idx = self.index(sprint_of(&job)).min(self.count - 1);
            buckets[idx].push(job);
        }
        buckets
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// State shared by every worker of a run.
struct RunContext {
    tracker: Arc<dyn TrackerClient>,
    ledger: Arc<SnapshotLedger>,
    policy: RetryPolicy,
    /// Child of the caller's token; cancelled on external cancel or abort.
    abort: CancellationToken,
    abort_reason: Mutex<Option<AbortReason>>,
}

impl RunContext {
    fn abort_auth(&self, key: &ResourceKey, message: String) {
        {
            let mut reason = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
            if reason.is_none() {
                tracing::error!(key = %key, %message, "authentication failed; aborting run");
                *reason = Some(AbortReason::AuthFailed {
                    key: key.clone(),
                    message,
                });
            }
        }
        self.abort.cancel();
    }

    fn take_abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

enum CreateOutput {
    Finished(ReconciliationResult),
    NotAttempted(NotAttempted),
}

struct Creator {
    ctx: Arc<RunContext>,
}

#[async_trait]
impl JobHandler for Creator {
    type Job = DesiredResource;
    type Output = CreateOutput;

    async fn handle(
        &self,
        job: DesiredResource,
        pacer: &mut Pacer,
        cancel: &CancellationToken,
    ) -> CreateOutput {
        let ctx = &self.ctx;
        let key = &job.key;
        let mut state = Tracked::default();
        step(&mut state, key, ResourceState::Checking);

        match ctx.ledger.claim_or_wait(key, cancel).await {
            Some(Claim::Granted) => {}
            Some(Claim::Known(remote)) => {
                tracing::debug!(key = %key, "created concurrently by another worker");
                step(&mut state, key, ResourceState::Exists);
                return CreateOutput::Finished(reconciled(&job, Outcome::AlreadyExists, remote, 0));
            }
            Some(Claim::Unverified(reason)) => {
                step(&mut state, key, ResourceState::Failed);
                return CreateOutput::Finished(reconciled(&job, unverified(&reason), None, 0));
            }
            Some(Claim::Busy) | None => return CreateOutput::NotAttempted(skipped(&job)),
        }

        let payload = job.payload_for_create(&ctx.ledger);
        let attempted = execute_with_retry(&ctx.policy, cancel, Some(&mut *pacer), || {
            ctx.tracker.create(&payload)
        })
        .await;
        let attempts = attempted.attempts;
        if let Err(e) = state.record_attempts(attempts) {
            tracing::error!(key = %key, error = %e, "resource state machine violation");
        }

        let (outcome, remote) = match attempted.result {
            Ok(remote) => {
                ctx.ledger.record_created(remote.clone());
                step(&mut state, key, ResourceState::Created);
                (Outcome::Created, Some(remote))
            }
            Err(TrackerError::Duplicate) => {
                let lookup = execute_with_retry(&ctx.policy, cancel, Some(&mut *pacer), || {
                    ctx.tracker.exists(key)
                })
                .await;
                let remote = match lookup.result {
                    Ok(remote) => remote,
                    Err(TrackerError::AuthFailed(message)) => {
                        ctx.abort_auth(key, message);
                        None
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "lookup after duplicate failed");
                        None
                    }
                };
                ctx.ledger.record_existing(key.clone(), remote.clone());
                step(&mut state, key, ResourceState::Exists);
                (Outcome::AlreadyExists, remote)
            }
            Err(error) => {
                ctx.ledger.release(key);
                step(&mut state, key, ResourceState::Failed);
                let reason = if attempted.interrupted {
                    format!("cancelled before retry: {error}")
                } else {
                    error.to_string()
                };
                if let TrackerError::AuthFailed(message) = error {
                    ctx.abort_auth(key, message);
                } else {
                    tracing::warn!(key = %key, attempts, %reason, "create failed");
                }
                (Outcome::Failed { reason }, None)
            }
        };

        tracing::debug!(key = %key, state = %state.state(), attempts, "resource reconciled");
        CreateOutput::Finished(reconciled(&job, outcome, remote, attempts))
    }

    fn panicked(&self, job: DesiredResource, message: String) -> CreateOutput {
        self.ctx.ledger.release(&job.key);
        let outcome = Outcome::Failed {
            reason: format!("worker panicked: {message}"),
        };
        CreateOutput::Finished(reconciled(&job, outcome, None, 0))
    }
}

/// Finishing work for one issue created in this run.
#[derive(Clone)]
struct FinishJob {
    key: ResourceKey,
    sprint: Option<u32>,
    remote: RemoteRef,
    /// Re-rendered payload, present only when the body changed.
    update: Option<ResourcePayload>,
    board: bool,
}

fn finish_jobs(
    plan: &Plan,
    ledger: &SnapshotLedger,
    results: &[ReconciliationResult],
    specs: &HashMap<ResourceKey, DesiredResource>,
    board: bool,
) -> Vec<FinishJob> {
    let resolve_ref = |id| {
        match issue_key_for(plan, id).and_then(|key| ledger.remote(&key)) {
            Some(remote) => Reference::Issue(remote.id),
            None => Reference::Unresolved,
        }
    };

    results
        .iter()
        .filter(|r| r.outcome == Outcome::Created && r.kind() == ResourceKind::Issue)
        .filter_map(|r| {
            let remote = r.remote.clone()?;
            let spec = specs.get(&r.key)?;
            let node = plan.node(r.node?)?;
            let body = render_issue_body(plan, node, resolve_ref);
            // The create payload still carries the unresolved body.
            let update = match spec.payload_for_create(ledger) {
                ResourcePayload::Issue(mut issue) if issue.body != body => {
                    issue.body = body;
                    Some(ResourcePayload::Issue(issue))
                }
                _ => None,
            };
            Some(FinishJob {
                key: r.key.clone(),
                sprint: r.sprint,
                remote,
                update,
                board,
            })
        })
        .collect()
}

struct Finisher {
    ctx: Arc<RunContext>,
}

impl Finisher {
    async fn link_step<F, Fut>(
        &self,
        key: &ResourceKey,
        step: LinkStep,
        pacer: &mut Pacer,
        cancel: &CancellationToken,
        op: F,
    ) -> LinkResult
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), TrackerError>>,
    {
        let attempted = execute_with_retry(&self.ctx.policy, cancel, Some(pacer), op).await;
        let outcome = match attempted.result {
            Ok(()) => LinkOutcome::Updated,
            Err(error) => {
                let reason = error.to_string();
                if let TrackerError::AuthFailed(message) = error {
                    self.ctx.abort_auth(key, message);
                } else {
                    tracing::warn!(key = %key, ?step, %reason, "finishing step failed");
                }
                LinkOutcome::Failed { reason }
            }
        };
        LinkResult {
            key: key.clone(),
            step,
            outcome,
            attempts: attempted.attempts,
        }
    }
}

#[async_trait]
impl JobHandler for Finisher {
    type Job = FinishJob;
    type Output = Vec<LinkResult>;

    async fn handle(
        &self,
        job: FinishJob,
        pacer: &mut Pacer,
        cancel: &CancellationToken,
    ) -> Vec<LinkResult> {
        let tracker = &self.ctx.tracker;
        let mut out = Vec::with_capacity(2);

        match &job.update {
            Some(payload) => {
                let result = self
                    .link_step(&job.key, LinkStep::Body, pacer, cancel, || {
                        tracker.update(&job.remote, payload)
                    })
                    .await;
                out.push(result);
            }
            None => out.push(LinkResult {
                key: job.key.clone(),
                step: LinkStep::Body,
                outcome: LinkOutcome::Unchanged,
                attempts: 0,
            }),
        }

        if job.board && !cancel.is_cancelled() {
            let result = self
                .link_step(&job.key, LinkStep::Board, pacer, cancel, || {
                    tracker.set_board_status(&job.remote, BoardStatus::Todo)
                })
                .await;
            out.push(result);
        }
        out
    }

    fn panicked(&self, job: FinishJob, message: String) -> Vec<LinkResult> {
        vec![LinkResult {
            key: job.key,
            step: LinkStep::Body,
            outcome: LinkOutcome::Failed {
                reason: format!("worker panicked: {message}"),
            },
            attempts: 0,
        }]
    }
}
