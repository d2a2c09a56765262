//! Run configuration passed explicitly into every synchronization.
//!
//! [`SyncConfig`] deserializes from TOML with defaults for every field;
//! locating and layering config files is the CLI's job.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid sprint range {0:?} (expected \"A-B\" or \"N\")")]
    InvalidSprintRange(String),

    #[error("sprint range {start}-{end} is reversed")]
    ReversedSprintRange { start: u32, end: u32 },

    #[error("partitions must be at least 1")]
    ZeroPartitions,

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("retry.multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(String),

    #[error("category label name must not be empty")]
    EmptyCategoryLabel,

    #[error("category label {0:?} is configured more than once")]
    DuplicateCategoryLabel(String),

    #[error("category label {0:?} collides with a sprint label")]
    ReservedCategoryLabel(String),

    #[error("sprint definition {0} appears more than once")]
    DuplicateSprintDefinition(u32),
}

fn is_sprint_label(name: &str) -> bool {
    name.strip_prefix("sprint-")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Inclusive range of sprint numbers (`"2-4"` or `"3"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SprintRange {
    pub start: u32,
    pub end: u32,
}

impl SprintRange {
    pub fn new(start: u32, end: u32) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::ReversedSprintRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, sprint: u32) -> bool {
        (self.start..=self.end).contains(&sprint)
    }
}

impl fmt::Display for SprintRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for SprintRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSprintRange(s.to_owned());
        let s = s.trim();
        match s.split_once('-') {
            Some((a, b)) => {
                let start = a.trim().parse().map_err(|_| invalid())?;
                let end = b.trim().parse().map_err(|_| invalid())?;
                Self::new(start, end)
            }
            None => {
                let n = s.parse().map_err(|_| invalid())?;
                Ok(Self { start: n, end: n })
            }
        }
    }
}

impl From<SprintRange> for String {
    fn from(range: SprintRange) -> Self {
        range.to_string()
    }
}

impl TryFrom<String> for SprintRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Retry knobs as stored in TOML (milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Which plan nodes a category label is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliesTo {
    Tasks,
    Gates,
    #[default]
    All,
}

/// Extra label created once per run and attached to matching issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLabel {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub applies_to: AppliesTo,
}

/// Per-sprint milestone overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintDefinition {
    pub number: u32,
    #[serde(default)]
    pub description: Option<String>,
    /// ISO 8601 timestamp for the milestone due date.
    #[serde(default)]
    pub due_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub organization: String,
    pub repository: String,
    /// Workers per partition pool. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Number of contiguous sprint ranges processed by independent pools.
    pub partitions: usize,
    pub sprint_range: Option<SprintRange>,
    /// Minimum spacing between one worker's consecutive remote calls.
    pub pacing_ms: u64,
    pub retry: RetrySettings,
    /// Place newly created issues on the project board.
    pub add_to_board: bool,
    pub category_labels: Vec<CategoryLabel>,
    pub sprints: Vec<SprintDefinition>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            organization: String::new(),
            repository: String::new(),
            concurrency: 4,
            partitions: 1,
            sprint_range: None,
            pacing_ms: 250,
            retry: RetrySettings::default(),
            add_to_board: false,
            category_labels: Vec::new(),
            sprints: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::ZeroPartitions);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(
                self.retry.multiplier.to_string(),
            ));
        }
        if self.category_labels.iter().any(|l| l.name.trim().is_empty()) {
            return Err(ConfigError::EmptyCategoryLabel);
        }
        // Tracker label names compare case-insensitively.
        let mut names = std::collections::HashSet::new();
        for label in &self.category_labels {
            let name = label.name.to_lowercase();
            if is_sprint_label(&name) {
                return Err(ConfigError::ReservedCategoryLabel(label.name.clone()));
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateCategoryLabel(label.name.clone()));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for def in &self.sprints {
            if !seen.insert(def.number) {
                return Err(ConfigError::DuplicateSprintDefinition(def.number));
            }
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn sprint_definition(&self, number: u32) -> Option<&SprintDefinition> {
        self.sprints.iter().find(|d| d.number == number)
    }

    pub fn includes_sprint(&self, number: u32) -> bool {
        self.sprint_range.is_none_or(|r| r.contains(number))
    }
}
