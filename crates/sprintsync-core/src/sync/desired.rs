//! Desired remote state derived from a plan.
//!
//! Natural keys:
//!
//! | resource       | key                                   |
//! |----------------|---------------------------------------|
//! | sprint label   | `sprint-<n>`                          |
//! | category label | configured name                       |
//! | milestone      | `Sprint <n>: <name>`                  |
//! | task issue     | `[<id>] <name>`                       |
//! | gate issue     | `[<n>.G] Sprint <n> Gate: <name>`     |

use crate::config::{AppliesTo, SyncConfig};
use crate::graph::DependencyGraph;
use crate::plan::{NodeId, NodeRef, Plan, Sprint, Task};
use crate::snapshot::SnapshotLedger;
use crate::tracker::{
    IssuePayload, LabelPayload, MilestonePayload, ResourceKey, ResourceKind, ResourcePayload,
};

use super::links::{Reference, render_issue_body};

pub const SPRINT_LABEL_COLOR: &str = "1d76db";

pub fn sprint_label(number: u32) -> String {
    format!("sprint-{number}")
}

pub fn milestone_title(sprint: &Sprint) -> String {
    format!("Sprint {}: {}", sprint.number, sprint.name)
}

pub fn task_issue_title(task: &Task) -> String {
    format!("[{}] {}", task.id, task.name)
}

pub fn gate_issue_title(sprint: &Sprint) -> String {
    format!(
        "[{}] Sprint {} Gate: {}",
        sprint.gate.id, sprint.number, sprint.name
    )
}

/// Issue key for any plan node.
pub fn issue_key(node: NodeRef<'_>) -> ResourceKey {
    match node {
        NodeRef::Task(_, task) => ResourceKey::issue(task_issue_title(task)),
        NodeRef::Gate(sprint) => ResourceKey::issue(gate_issue_title(sprint)),
    }
}

/// Issue key for a node id, if the node exists in `plan`.
pub fn issue_key_for(plan: &Plan, id: NodeId) -> Option<ResourceKey> {
    plan.node(id).map(issue_key)
}

/// One resource the tracker should hold after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredResource {
    pub key: ResourceKey,
    /// Owning sprint; `None` for category labels.
    pub sprint: Option<u32>,
    /// Plan node for issues.
    pub node: Option<NodeId>,
    /// Creation payload. Issue bodies carry unresolved references and no
    /// milestone number until creation time.
    pub payload: ResourcePayload,
    /// Milestone an issue belongs to.
    pub milestone: Option<ResourceKey>,
    /// Rank within its kind: graph position for issues, sprint order for
    /// labels and milestones.
    pub rank: usize,
}

impl DesiredResource {
    pub fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    /// Payload to send on create, with the issue milestone filled in from
    /// the ledger when the milestone is known.
    pub fn payload_for_create(&self, ledger: &SnapshotLedger) -> ResourcePayload {
        let mut payload = self.payload.clone();
        if let (ResourcePayload::Issue(issue), Some(milestone)) = (&mut payload, &self.milestone) {
            issue.milestone = ledger.remote(milestone).map(|r| r.id);
        }
        payload
    }

    fn order_key(&self) -> (ResourceKind, usize) {
        (self.kind(), self.rank)
    }
}

/// Derive every desired resource for the sprints selected by `config`,
/// sorted by kind and then rank.
pub fn derive(plan: &Plan, graph: &DependencyGraph, config: &SyncConfig) -> Vec<DesiredResource> {
    let sprints: Vec<&Sprint> = plan
        .sprints
        .iter()
        .filter(|s| config.includes_sprint(s.number))
        .collect();

    let mut out = Vec::new();
    let categories = config.category_labels.len();

    for (i, category) in config.category_labels.iter().enumerate() {
        out.push(DesiredResource {
            key: ResourceKey::label(&category.name),
            sprint: None,
            node: None,
            payload: ResourcePayload::Label(LabelPayload {
                name: category.name.clone(),
                color: category.color.clone(),
                description: category.description.clone(),
            }),
            milestone: None,
            rank: i,
        });
    }

    for sprint in &sprints {
        let name = sprint_label(sprint.number);
        out.push(DesiredResource {
            key: ResourceKey::label(&name),
            sprint: Some(sprint.number),
            node: None,
            payload: ResourcePayload::Label(LabelPayload {
                name,
                color: Some(SPRINT_LABEL_COLOR.to_string()),
                description: Some(milestone_title(sprint)),
            }),
            milestone: None,
            rank: categories + sprint.number as usize,
        });

        let definition = config.sprint_definition(sprint.number);
        let description = definition
            .and_then(|d| d.description.clone())
            .unwrap_or_else(|| sprint.description.clone());
        let title = milestone_title(sprint);
        out.push(DesiredResource {
            key: ResourceKey::milestone(&title),
            sprint: Some(sprint.number),
            node: None,
            payload: ResourcePayload::Milestone(MilestonePayload {
                title,
                description,
                due_on: definition.and_then(|d| d.due_on.clone()),
            }),
            milestone: None,
            rank: sprint.number as usize,
        });
    }

    for sprint in &sprints {
        let milestone = ResourceKey::milestone(milestone_title(sprint));
        let nodes = sprint
            .tasks
            .iter()
            .map(|task| NodeRef::Task(sprint, task))
            .chain(std::iter::once(NodeRef::Gate(sprint)));
        for node in nodes {
            let id = node.id();
            let key = issue_key(node);
            let body = render_issue_body(plan, node, |_| Reference::Unresolved);
            out.push(DesiredResource {
                payload: ResourcePayload::Issue(IssuePayload {
                    title: key.name.clone(),
                    body,
                    labels: issue_labels(config, sprint.number, id.is_gate()),
                    milestone: None,
                }),
                key,
                sprint: Some(sprint.number),
                node: Some(id),
                milestone: Some(milestone.clone()),
                rank: graph.position(id).unwrap_or(usize::MAX),
            });
        }
    }

    out.sort_by_key(DesiredResource::order_key);
    out
}

fn issue_labels(config: &SyncConfig, sprint: u32, gate: bool) -> Vec<String> {
    let mut labels = vec![sprint_label(sprint)];
    labels.extend(
        config
            .category_labels
            .iter()
            .filter(|c| match c.applies_to {
                AppliesTo::All => true,
                AppliesTo::Tasks => !gate,
                AppliesTo::Gates => gate,
            })
            .map(|c| c.name.clone()),
    );
    labels
}
