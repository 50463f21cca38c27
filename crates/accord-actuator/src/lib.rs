//! Retrying task dispatcher for remote participant calls.
//!
//! The actuator owns a queue of [`Task`] records, invokes them through a
//! host-supplied [`Caller`], and retries definite failures with per-task
//! attempt limits and recall intervals. Each finished task leaves a
//! [`TaskEvent`] behind; each scheduling pass reports its completions to
//! whoever drives it (the transaction manager drains them into its own
//! bookkeeping).

pub mod actuator;
pub mod caller;
pub mod model;

pub use actuator::{Actuator, ActuatorData, ActuatorError, QueuedTask};
pub use caller::{CallFault, Caller};
pub use model::{Task, TaskCompletion, TaskEvent, TaskStatus, Tcid, Toid, Ttid};
