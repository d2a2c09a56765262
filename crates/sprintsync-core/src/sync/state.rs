//! Per-resource reconciliation state machine.
//!
//! ```text
//! pending             -> checking
//! pending             -> exists               (ledger hit)
//! checking            -> exists
//! checking            -> failed               (existence unknown)
//! checking            -> create_attempted(1)
//! create_attempted(n) -> create_attempted(n+1)
//! create_attempted(n) -> created
//! create_attempted(n) -> exists               (duplicate)
//! create_attempted(n) -> failed
//! ```
//!
//! `exists`, `created`, and `failed` are terminal.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Pending,
    Checking,
    Exists,
    CreateAttempted { attempt: u32 },
    Created,
    Failed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Checking => f.write_str("checking"),
            Self::Exists => f.write_str("exists"),
            Self::CreateAttempted { attempt } => write!(f, "create_attempted({attempt})"),
            Self::Created => f.write_str("created"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid resource state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ResourceState,
    pub to: ResourceState,
}

impl ResourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exists | Self::Created | Self::Failed)
    }

    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        match (from, to) {
            (Self::Pending, Self::Checking | Self::Exists) => true,
            (Self::Checking, Self::Exists | Self::Failed) => true,
            (Self::Checking, Self::CreateAttempted { attempt }) => attempt == 1,
            (Self::CreateAttempted { attempt: n }, Self::CreateAttempted { attempt: m }) => {
                m == n + 1
            }
            (Self::CreateAttempted { .. }, Self::Created | Self::Exists | Self::Failed) => true,
            _ => false,
        }
    }

    /// Move to `to`, rejecting edges outside the transition graph.
    pub fn advance(self, to: Self) -> Result<Self, InvalidTransition> {
        if Self::is_valid_transition(self, to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

/// Current state of one resource during a run.
#[derive(Debug, Clone)]
pub struct Tracked {
    state: ResourceState,
}

impl Default for Tracked {
    fn default() -> Self {
        Self {
            state: ResourceState::Pending,
        }
    }
}

impl Tracked {
    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn advance(&mut self, to: ResourceState) -> Result<(), InvalidTransition> {
        self.state = self.state.advance(to)?;
        Ok(())
    }

    /// Step through one `create_attempted(n)` state per attempt made.
    pub fn record_attempts(&mut self, attempts: u32) -> Result<(), InvalidTransition> {
        for attempt in 1..=attempts {
            self.advance(ResourceState::CreateAttempted { attempt })?;
        }
        Ok(())
    }
}
