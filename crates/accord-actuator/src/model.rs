use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Order id. Monotonic, starting at 1.
pub type Toid = u64;

/// Task id, assigned by the actuator. Monotonic, starting at 1.
pub type Ttid = u64;

/// Compensation id. Drawn from the same id space as [`Ttid`].
pub type Tcid = Ttid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Final or in-flight status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Error,
    Unknown,
}

impl TaskStatus {
    /// Whether this status is terminal (the task will not run again).
    pub fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Unknown)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "doing" => Ok(Self::Doing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Default number of attempts before a definite failure becomes final.
pub const DEFAULT_ATTEMPTS_MAX: u32 = 5;

/// One schedulable remote call.
///
/// `callee` and `call_type` identify the operation for the [`crate::Caller`];
/// the `data` payload is opaque to the actuator and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identity of the party this call targets.
    pub callee: String,
    /// Operation tag the caller dispatches on (e.g. "prepare", "commit").
    pub call_type: String,
    /// Task ids that must be completed before this task may run.
    pub pre_ttids: Vec<Ttid>,
    /// Owning order, if any.
    pub toid: Option<Toid>,
    /// The prepare this commit/compensation serves, if any.
    pub for_ttid: Option<Ttid>,
    /// Attempts before a definite failure becomes a final `Error`.
    pub attempts_max: u32,
    /// Minimum delay between attempts.
    pub recall_interval: Duration,
    /// Resource budget forwarded to the caller alongside the payload.
    pub budget: u64,
    /// Opaque payload.
    pub data: Value,
    /// Creation time.
    pub time: DateTime<Utc>,
}

impl Task {
    /// Build a task with default retry settings and no ownership links.
    pub fn new(callee: impl Into<String>, call_type: impl Into<String>, data: Value) -> Self {
        Self {
            callee: callee.into(),
            call_type: call_type.into(),
            pre_ttids: Vec::new(),
            toid: None,
            for_ttid: None,
            attempts_max: DEFAULT_ATTEMPTS_MAX,
            recall_interval: Duration::ZERO,
            budget: 0,
            data,
            time: Utc::now(),
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, attempts_max: u32, recall_interval: Duration) -> Self {
        self.attempts_max = attempts_max;
        self.recall_interval = recall_interval;
        self
    }

    /// Attach a resource budget forwarded to the caller.
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }
}

/// Record of a finished task: what ran, how often, and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub ttid: Ttid,
    pub toid: Option<Toid>,
    pub task: Task,
    /// Attempts consumed, including the final one.
    pub attempts: u32,
    pub status: TaskStatus,
    /// The caller's reply on success, or an error object on failure.
    pub receipt: Value,
    /// Completion time.
    pub time: DateTime<Utc>,
}

/// A completion reported by one scheduling pass, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub ttid: Ttid,
    pub task: Task,
    pub status: TaskStatus,
    pub receipt: Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
