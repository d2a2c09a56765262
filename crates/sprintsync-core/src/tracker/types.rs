//! Resource identity, payloads, and the tracker error taxonomy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of remote resource. Ordered in creation-phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Label,
    Milestone,
    Issue,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Label => "label",
            Self::Milestone => "milestone",
            Self::Issue => "issue",
        };
        f.write_str(s)
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "label" => Ok(Self::Label),
            "milestone" => Ok(Self::Milestone),
            "issue" => Ok(Self::Issue),
            other => Err(format!("unknown resource kind: {other:?}")),
        }
    }
}

/// Natural identity of a remote resource: label name, milestone title, or
/// issue title.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn label(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Label, name)
    }

    pub fn milestone(title: impl Into<String>) -> Self {
        Self::new(ResourceKind::Milestone, title)
    }

    pub fn issue(title: impl Into<String>) -> Self {
        Self::new(ResourceKind::Issue, title)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Tracker-assigned identifier: a label name, a milestone number, or an
/// issue number, kept as the tracker returned it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RemoteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A resource that is known to exist remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub key: ResourceKey,
    pub id: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPayload {
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestonePayload {
    pub title: String,
    pub description: String,
    /// ISO 8601 due date, passed through unchanged.
    pub due_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePayload {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// Milestone number, if the sprint milestone is known.
    pub milestone: Option<RemoteId>,
}

/// Everything needed to create (or update) one remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourcePayload {
    Label(LabelPayload),
    Milestone(MilestonePayload),
    Issue(IssuePayload),
}

impl ResourcePayload {
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Label(p) => ResourceKey::label(&p.name),
            Self::Milestone(p) => ResourceKey::milestone(&p.title),
            Self::Issue(p) => ResourceKey::issue(&p.title),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Label(_) => ResourceKind::Label,
            Self::Milestone(_) => ResourceKind::Milestone,
            Self::Issue(_) => ResourceKind::Issue,
        }
    }
}

/// Failure classes a tracker can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("rate limited by tracker{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("resource already exists")]
    Duplicate,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("tracker error: {0}")]
    Unknown(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

/// Column on the project board an issue is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Todo,
    InProgress,
    Testing,
    Review,
    Done,
}

impl fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "Todo",
            Self::InProgress => "In Progress",
            Self::Testing => "Testing",
            Self::Review => "Review",
            Self::Done => "Done",
        };
        f.write_str(s)
    }
}
