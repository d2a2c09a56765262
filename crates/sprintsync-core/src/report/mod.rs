//! Run summaries for humans and machines.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::sync::{AbortReason, LinkOutcome, NotAttempted, Outcome, SyncReport};
use crate::tracker::{ResourceKey, ResourceKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub created: usize,
    pub already_exists: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

impl Counts {
    pub fn total(&self) -> usize {
        self.created + self.already_exists + self.failed + self.not_attempted
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::AlreadyExists => self.already_exists += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub key: ResourceKey,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounts {
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Aggregated view of a [`SyncReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub run_id: String,
    pub totals: Counts,
    pub by_kind: BTreeMap<ResourceKind, Counts>,
    /// Resources not tied to a sprint (category labels) are under `shared`.
    pub by_sprint: BTreeMap<u32, Counts>,
    pub shared: Counts,
    pub failures: Vec<Failure>,
    pub not_attempted: Vec<ResourceKey>,
    pub links: LinkCounts,
    pub link_failures: Vec<Failure>,
    pub aborted: Option<AbortReason>,
}

impl Summary {
    /// Process exit status for the CLI: 0 clean, 1 failures or skipped
    /// work, 2 authentication abort, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match &self.aborted {
            Some(AbortReason::AuthFailed { .. }) => 2,
            Some(AbortReason::Cancelled) => 130,
            None if self.totals.failed > 0 || self.totals.not_attempted > 0 => 1,
            None => 0,
        }
    }
}

/// Build a [`Summary`]. Every desired resource of the run appears exactly
/// once, either as a result or as not attempted.
pub fn summarize(report: &SyncReport) -> Summary {
    let mut totals = Counts::default();
    let mut by_kind: BTreeMap<ResourceKind, Counts> = BTreeMap::new();
    let mut by_sprint: BTreeMap<u32, Counts> = BTreeMap::new();
    let mut shared = Counts::default();
    let mut failures = Vec::new();

    for result in &report.results {
        totals.record(&result.outcome);
        by_kind.entry(result.kind()).or_default().record(&result.outcome);
        match result.sprint {
            Some(n) => by_sprint.entry(n).or_default().record(&result.outcome),
            None => shared.record(&result.outcome),
        }
        if let Outcome::Failed { reason } = &result.outcome {
            failures.push(Failure {
                key: result.key.clone(),
                reason: reason.clone(),
                attempts: result.attempts,
            });
        }
    }

    for NotAttempted { key, sprint } in &report.not_attempted {
        totals.not_attempted += 1;
        by_kind.entry(key.kind).or_default().not_attempted += 1;
        match sprint {
            Some(n) => by_sprint.entry(*n).or_default().not_attempted += 1,
            None => shared.not_attempted += 1,
        }
    }

    let mut links = LinkCounts::default();
    let mut link_failures = Vec::new();
    for link in &report.links {
        match &link.outcome {
            LinkOutcome::Updated => links.updated += 1,
            LinkOutcome::Unchanged => links.unchanged += 1,
            LinkOutcome::Failed { reason } => {
                links.failed += 1;
                link_failures.push(Failure {
                    key: link.key.clone(),
                    reason: reason.clone(),
                    attempts: link.attempts,
                });
            }
        }
    }

    Summary {
        run_id: report.run_id.to_string(),
        totals,
        by_kind,
        by_sprint,
        shared,
        failures,
        not_attempted: report.not_attempted.iter().map(|n| n.key.clone()).collect(),
        links,
        link_failures,
        aborted: report.aborted.clone(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::sync::{LinkResult, LinkStep, ReconciliationResult};

    fn result(key: ResourceKey, sprint: Option<u32>, outcome: Outcome) -> ReconciliationResult {
        ReconciliationResult {
            key,
            sprint,
            node: None,
            outcome,
            remote: None,
            attempts: 1,
        }
    }

    fn report() -> SyncReport {
        SyncReport {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            plan_fingerprint: String::new(),
            results: vec![
                result(ResourceKey::label("task"), None, Outcome::Created),
                result(ResourceKey::label("sprint-0"), Some(0), Outcome::AlreadyExists),
                result(
                    ResourceKey::issue("[0.1] A"),
                    Some(0),
                    Outcome::Failed {
                        reason: "tracker error: boom".into(),
                    },
                ),
            ],
            not_attempted: vec![NotAttempted {
                key: ResourceKey::issue("[1.1] B"),
                sprint: Some(1),
            }],
            links: vec![LinkResult {
                key: ResourceKey::issue("[0.2] C"),
                step: LinkStep::Board,
                outcome: LinkOutcome::Failed {
                    reason: "no board".into(),
                },
                attempts: 1,
            }],
            aborted: None,
        }
    }

    #[test]
    fn counts_every_resource_once() {
        let summary = summarize(&report());
        assert_eq!(
            summary.totals,
            Counts {
                created: 1,
                already_exists: 1,
                failed: 1,
                not_attempted: 1
            }
        );
        assert_eq!(summary.totals.total(), 4);
        assert_eq!(summary.shared.created, 1);
        assert_eq!(summary.by_sprint[&0].failed, 1);
        assert_eq!(summary.by_sprint[&1].not_attempted, 1);
        assert_eq!(summary.by_kind[&ResourceKind::Issue].total(), 2);
    }

    #[test]
    fn lists_failures_with_attempts() {
        let summary = summarize(&report());
        assert_eq!(
            summary.failures,
            vec![Failure {
                key: ResourceKey::issue("[0.1] A"),
                reason: "tracker error: boom".into(),
                attempts: 1,
            }]
        );
        assert_eq!(summary.not_attempted, vec![ResourceKey::issue("[1.1] B")]);
        assert_eq!(summary.links.failed, 1);
        assert_eq!(summary.link_failures[0].reason, "no board");
    }

    #[test]
    fn exit_code_reflects_outcome() {
        let mut r = report();
        assert_eq!(summarize(&r).exit_code(), 1);

        r.aborted = Some(AbortReason::Cancelled);
        assert_eq!(summarize(&r).exit_code(), 130);

        r.aborted = Some(AbortReason::AuthFailed {
            key: ResourceKey::label("x"),
            message: "401".into(),
        });
        assert_eq!(summarize(&r).exit_code(), 2);

        r.aborted = None;
        r.results.truncate(2);
        r.not_attempted.clear();
        assert_eq!(summarize(&r).exit_code(), 0);
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_value(summarize(&report())).unwrap();
        assert_eq!(json["totals"]["created"], 1);
        assert_eq!(json["by_kind"]["issue"]["failed"], 1);
        assert_eq!(json["by_sprint"]["1"]["not_attempted"], 1);
    }
}
