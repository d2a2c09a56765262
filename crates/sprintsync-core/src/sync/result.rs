//! Run results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::plan::NodeId;
use crate::tracker::{RemoteRef, ResourceKey, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Created,
    AlreadyExists,
    Failed { reason: String },
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Final outcome for one desired resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub key: ResourceKey,
    pub sprint: Option<u32>,
    pub node: Option<NodeId>,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub remote: Option<RemoteRef>,
    /// Create calls issued; 0 when the resource was already known.
    pub attempts: u32,
}

impl ReconciliationResult {
    pub fn kind(&self) -> ResourceKind {
        self.key.kind
    }
}

/// A desired resource the run never reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotAttempted {
    pub key: ResourceKey,
    pub sprint: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStep {
    /// Issue body re-rendered with resolved cross references.
    Body,
    /// Issue placed on the project board.
    Board,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkOutcome {
    Updated,
    Unchanged,
    Failed { reason: String },
}

/// Outcome of one finishing-pass step for an issue created in the run.
/// Never affects the issue's own [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkResult {
    pub key: ResourceKey,
    pub step: LinkStep,
    #[serde(flatten)]
    pub outcome: LinkOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    AuthFailed { key: ResourceKey, message: String },
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthFailed { key, message } => {
                write!(f, "authentication failed on {key}: {message}")
            }
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan_fingerprint: String,
    /// Sorted by kind, then graph position.
    pub results: Vec<ReconciliationResult>,
    pub not_attempted: Vec<NotAttempted>,
    pub links: Vec<LinkResult>,
    pub aborted: Option<AbortReason>,
}

impl SyncReport {
    pub fn result_for(&self, key: &ResourceKey) -> Option<&ReconciliationResult> {
        self.results.iter().find(|r| &r.key == key)
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|o| *o == Outcome::Created)
    }

    pub fn already_existing(&self) -> usize {
        self.count(|o| *o == Outcome::AlreadyExists)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failed)
    }

    /// No failures, nothing skipped, not aborted.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_none() && self.not_attempted.is_empty() && self.failed() == 0
    }
}
