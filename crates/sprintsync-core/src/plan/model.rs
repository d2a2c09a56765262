//! Immutable plan graph produced by [`super::parse`].
//!
//! A [`Plan`] owns its sprints; each [`Sprint`] owns its tasks and exactly
//! one [`Gate`]. Every task and gate is addressed by a [`NodeId`]
//! (`"0.1"`, `"0.G"`), and the dependency/blocks sets are filled in by the
//! parser so downstream consumers never have to re-derive them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::ParseWarning;

// ---------------------------------------------------------------------------
// Node identifiers
// ---------------------------------------------------------------------------

/// Position of a node inside its sprint.
///
/// Tasks order before the gate, so a derived `Ord` on [`NodeId`] sorts
/// `0.1 < 0.2 < 0.G < 1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Task(u32),
    Gate,
}

/// Identifier of a task (`"<sprint>.<index>"`) or gate (`"<sprint>.G"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId {
    pub sprint: u32,
    pub slot: Slot,
}

impl NodeId {
    pub fn task(sprint: u32, index: u32) -> Self {
        Self {
            sprint,
            slot: Slot::Task(index),
        }
    }

    pub fn gate(sprint: u32) -> Self {
        Self {
            sprint,
            slot: Slot::Gate,
        }
    }

    pub fn is_gate(&self) -> bool {
        self.slot == Slot::Gate
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Slot::Task(index) => write!(f, "{}.{}", self.sprint, index),
            Slot::Gate => write!(f, "{}.G", self.sprint),
        }
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || NodeIdParseError(s.to_owned());
        let (sprint, slot) = s.trim().split_once('.').ok_or_else(err)?;
        let sprint: u32 = sprint.parse().map_err(|_| err())?;
        if slot.eq_ignore_ascii_case("g") {
            return Ok(Self::gate(sprint));
        }
        let index: u32 = slot.parse().map_err(|_| err())?;
        Ok(Self::task(sprint, index))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Error returned when parsing an invalid [`NodeId`] string.
#[derive(Debug, Clone)]
pub struct NodeIdParseError(pub String);

impl fmt::Display for NodeIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id: {:?} (expected <sprint>.<index> or <sprint>.G)", self.0)
    }
}

impl std::error::Error for NodeIdParseError {}

// ---------------------------------------------------------------------------
// Plan graph
// ---------------------------------------------------------------------------

/// Root aggregate: a titled, contiguous sequence of sprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub title: String,
    /// Sorted by number; numbers are exactly `0..sprints.len()`.
    pub sprints: Vec<Sprint>,
    /// Non-fatal findings from validation.
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sprint {
    pub number: u32,
    pub name: String,
    pub duration: Option<String>,
    pub description: String,
    pub tasks: Vec<Task>,
    pub acceptance_criteria: Vec<String>,
    pub gate: Gate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: NodeId,
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    /// Agent capability tag (e.g. `backend-dev`).
    pub agent: Option<String>,
    /// Path to a skill reference document.
    pub skill: Option<String>,
    pub depends_on: BTreeSet<NodeId>,
    pub blocks: BTreeSet<NodeId>,
}

/// Synthetic sprint-completion node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gate {
    pub id: NodeId,
    pub requirements: Vec<String>,
    pub depends_on: BTreeSet<NodeId>,
    pub blocks: BTreeSet<NodeId>,
}

/// Borrowed view over either kind of plan node.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Task(&'a Sprint, &'a Task),
    Gate(&'a Sprint),
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        match self {
            Self::Task(_, task) => task.id,
            Self::Gate(sprint) => sprint.gate.id,
        }
    }

    pub fn sprint(&self) -> &'a Sprint {
        match self {
            Self::Task(sprint, _) | Self::Gate(sprint) => sprint,
        }
    }

    pub fn depends_on(&self) -> &'a BTreeSet<NodeId> {
        match self {
            Self::Task(_, task) => &task.depends_on,
            Self::Gate(sprint) => &sprint.gate.depends_on,
        }
    }

    pub fn blocks(&self) -> &'a BTreeSet<NodeId> {
        match self {
            Self::Task(_, task) => &task.blocks,
            Self::Gate(sprint) => &sprint.gate.blocks,
        }
    }
}

impl Plan {
    pub fn sprint(&self, number: u32) -> Option<&Sprint> {
        self.sprints.iter().find(|s| s.number == number)
    }

    pub fn task(&self, id: NodeId) -> Option<&Task> {
        self.sprint(id.sprint)?.tasks.iter().find(|t| t.id == id)
    }

    pub fn node(&self, id: NodeId) -> Option<NodeRef<'_>> {
        let sprint = self.sprint(id.sprint)?;
        match id.slot {
            Slot::Gate => Some(NodeRef::Gate(sprint)),
            Slot::Task(_) => sprint
                .tasks
                .iter()
                .find(|t| t.id == id)
                .map(|t| NodeRef::Task(sprint, t)),
        }
    }

    /// All nodes in document order: each sprint's tasks, then its gate.
    pub fn nodes(&self) -> impl Iterator<Item = NodeRef<'_>> {
        self.sprints.iter().flat_map(|sprint| {
            sprint
                .tasks
                .iter()
                .map(move |task| NodeRef::Task(sprint, task))
                .chain(std::iter::once(NodeRef::Gate(sprint)))
        })
    }

    pub fn task_count(&self) -> usize {
        self.sprints.iter().map(|s| s.tasks.len()).sum()
    }

    /// The plan-level terminal node: the last sprint's gate.
    pub fn terminal(&self) -> Option<NodeId> {
        self.sprints.last().map(|s| s.gate.id)
    }

    /// SHA-256 (hex) of the plan's canonical JSON form.
    ///
    /// Two parses of the same text always share a fingerprint.
    pub fn fingerprint(&self) -> String {
        // Serializing plain owned data with ordered sets cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_and_parse() {
        assert_eq!(NodeId::task(0, 1).to_string(), "0.1");
        assert_eq!(NodeId::gate(3).to_string(), "3.G");
        assert_eq!("2.14".parse::<NodeId>().unwrap(), NodeId::task(2, 14));
        assert_eq!("1.g".parse::<NodeId>().unwrap(), NodeId::gate(1));
    }

    #[test]
    fn node_id_rejects_garbage() {
        for bad in ["", "1", "a.1", "1.x", "1.-2"] {
            assert!(bad.parse::<NodeId>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn node_id_orders_tasks_before_gate() {
        let mut ids = vec![
            NodeId::task(1, 1),
            NodeId::gate(0),
            NodeId::task(0, 2),
            NodeId::task(0, 1),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                NodeId::task(0, 1),
                NodeId::task(0, 2),
                NodeId::gate(0),
                NodeId::task(1, 1),
            ]
        );
    }

    #[test]
    fn node_id_serializes_as_string() {
        let json = serde_json::to_string(&NodeId::gate(4)).unwrap();
        assert_eq!(json, "\"4.G\"");
        let back: NodeId = serde_json::from_str("\"0.3\"").unwrap();
        assert_eq!(back, NodeId::task(0, 3));
    }
}
