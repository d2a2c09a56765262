//! Parse-time violations (fatal, aggregated) and warnings (non-fatal).

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::model::NodeId;

/// A single structural problem found while validating a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("no sprint headers found (expected lines like \"Sprint 0: Name\")")]
    NoSprints,

    #[error("sprint {number} is defined twice (lines {first_line} and {line})")]
    DuplicateSprint {
        number: u32,
        first_line: usize,
        line: usize,
    },

    #[error("sprint {0} is missing (sprint numbers must form a contiguous range starting at 0)")]
    MissingSprint(u32),

    #[error("sprints {first} through {last} are missing (sprint numbers must form a contiguous range starting at 0)")]
    MissingSprints { first: u32, last: u32 },

    #[error("duplicate task identifier {id} (lines {first_line} and {line})")]
    DuplicateTask {
        id: NodeId,
        first_line: usize,
        line: usize,
    },

    #[error("task {name:?} on line {line} appears before any sprint header")]
    TaskOutsideSprint { name: String, line: usize },

    #[error("task {id} on line {line} is declared inside sprint {sprint}")]
    SprintMismatch { id: NodeId, sprint: u32, line: usize },
}

/// Every violation found in a document, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ParseError {
    pub violations: Vec<Violation>,
}

impl ParseError {
    pub fn contains(&self, violation: &Violation) -> bool {
        self.violations.contains(violation)
    }

    pub fn duplicate_tasks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.violations.iter().filter_map(|v| match v {
            Violation::DuplicateTask { id, .. } => Some(*id),
            _ => None,
        })
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan document has {} violation(s):", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

/// Non-fatal validation finding carried on [`super::Plan::warnings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseWarning {
    MissingTitle,
    NoAcceptanceCriteria { sprint: u32 },
    NoGateRequirements { sprint: u32 },
    EmptySprint { sprint: u32 },
    UnknownMappingTarget { line: usize, target: String },
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTitle => f.write_str("document has no level-1 title heading"),
            Self::NoAcceptanceCriteria { sprint } => {
                write!(f, "sprint {sprint} has no acceptance criteria")
            }
            Self::NoGateRequirements { sprint } => {
                write!(f, "sprint {sprint} has no gate requirements")
            }
            Self::EmptySprint { sprint } => write!(f, "sprint {sprint} has no tasks"),
            Self::UnknownMappingTarget { line, target } => {
                write!(f, "agent mapping on line {line} refers to unknown task {target:?}")
            }
        }
    }
}
