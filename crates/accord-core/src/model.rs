use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use accord_actuator::{Task, TaskStatus, Tcid, Ttid};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an order. `Done` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Todo,
    Preparing,
    Committing,
    Compensating,
    Blocking,
    Done,
    Aborted,
}

impl OrderStatus {
    /// Whether this status is terminal.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Preparing => "preparing",
            Self::Committing => "committing",
            Self::Compensating => "compensating",
            Self::Blocking => "blocking",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderStatus {
    type Err = OrderStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "preparing" => Ok(Self::Preparing),
            "committing" => Ok(Self::Committing),
            "compensating" => Ok(Self::Compensating),
            "blocking" => Ok(Self::Blocking),
            "done" => Ok(Self::Done),
            "aborted" => Ok(Self::Aborted),
            other => Err(OrderStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OrderStatus`] string.
#[derive(Debug, Clone)]
pub struct OrderStatusParseError(pub String);

impl fmt::Display for OrderStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid order status: {:?}", self.0)
    }
}

impl std::error::Error for OrderStatusParseError {}

// ---------------------------------------------------------------------------

/// Whether an order accepts new participants.
///
/// Participants may only be pushed while the gate is `Opening`; the gate
/// must be `Closed` before a phase outcome may move the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Opening,
    Closed,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opening => "opening",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for Gate {
    type Err = GateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opening" => Ok(Self::Opening),
            "closed" => Ok(Self::Closed),
            other => Err(GateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Gate`] string.
#[derive(Debug, Clone)]
pub struct GateParseError(pub String);

impl fmt::Display for GateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid gate: {:?}", self.0)
    }
}

impl std::error::Error for GateParseError {}

// ---------------------------------------------------------------------------

/// The three phases of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Commit,
    Compensate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Compensate => "compensate",
        };
        f.write_str(s)
    }
}

/// Aggregate outcome of one phase over its per-task statuses.
///
/// `No` dominates `Doing` dominates `Yes`; an empty phase is vacuously
/// `Yes`. A missing order is `Option::None` at the lookup seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseResult {
    Yes,
    No,
    Doing,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One logical party of an order, with its prepare call, the commit call
/// held back until the prepare phase succeeds, and an optional
/// compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Id of the prepare task at the actuator.
    pub ttid: Ttid,
    pub prepare: Task,
    pub commit: Task,
    pub comp: Option<Task>,
    /// Status of the prepare call.
    pub status: TaskStatus,
}

/// A commit pushed to the actuator during commit fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitTask {
    /// Id assigned when the commit was pushed.
    pub ttid: Ttid,
    pub task: Task,
    /// The prepare this commit serves.
    pub prepare_ttid: Ttid,
    pub status: TaskStatus,
}

/// A compensation pushed during compensate fan-out or appended by an
/// operator. At most one exists per participant, and only for
/// participants whose prepare finished `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub tcid: Tcid,
    /// The prepare being undone.
    pub for_ttid: Ttid,
    pub task: Task,
    pub status: TaskStatus,
}

/// A transaction envelope grouping participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub participants: Vec<Participant>,
    pub commits: Vec<CommitTask>,
    pub compensations: Vec<Compensation>,
    pub gate: Gate,
    pub status: OrderStatus,
    /// How the order-completion callback ended, once fired.
    pub callback_status: Option<TaskStatus>,
    /// Creation time; retention is measured from here.
    pub time: DateTime<Utc>,
    /// Opaque host payload, handed back to the order callback.
    pub data: Option<Value>,
}

impl Order {
    /// A fresh, open, empty order.
    pub fn new(data: Option<Value>) -> Self {
        Self {
            participants: Vec::new(),
            commits: Vec::new(),
            compensations: Vec::new(),
            gate: Gate::Opening,
            status: OrderStatus::Todo,
            callback_status: None,
            time: Utc::now(),
            data,
        }
    }

    /// Look up a participant by its prepare id.
    pub fn participant(&self, ttid: Ttid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.ttid == ttid)
    }

    /// Whether a compensation already exists for this prepare.
    pub fn has_compensation_for(&self, for_ttid: Ttid) -> bool {
        self.compensations.iter().any(|c| c.for_ttid == for_ttid)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
