//! The actuator: a retrying, prerequisite-aware dispatcher of queued tasks.
//!
//! Tasks are attempted in id order, one scheduling pass at a time. A pass
//! invokes every queued task whose prerequisites are completed and whose
//! recall time has arrived, and returns the completions it produced so the
//! owner can fold them into its own state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::caller::{CallFault, Caller};
use crate::model::{Task, TaskCompletion, TaskEvent, TaskStatus, Toid, Ttid};

/// Default retention for finished task events before [`Actuator::clear`]
/// sweeps them.
pub const DEFAULT_EVENT_EXPIRATION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Errors for operations on queued tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActuatorError {
    /// No queued task carries this id.
    #[error("no queued task with id {0}")]
    TaskNotFound(Ttid),
    /// The task has consumed at least one attempt and can no longer be
    /// replaced or removed individually.
    #[error("task {0} has already started")]
    TaskStarted(Ttid),
}

/// A task waiting in the queue, with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,
}

/// Serializable snapshot of all actuator state except the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorData {
    pub index: Ttid,
    pub first_index: Ttid,
    pub queue: Vec<(Ttid, QueuedTask)>,
    pub events: Vec<(Ttid, TaskEvent)>,
    pub event_expiration: Duration,
}

/// The retrying task dispatcher.
pub struct Actuator {
    caller: Arc<dyn Caller>,
    /// Next task id to allocate. Starts at 1.
    index: Ttid,
    /// Ids below this have been garbage collected.
    first_index: Ttid,
    /// Queued (not yet finished) tasks, attempted in id order.
    queue: BTreeMap<Ttid, QueuedTask>,
    /// Finished tasks.
    events: BTreeMap<Ttid, TaskEvent>,
    event_expiration: Duration,
}

impl Actuator {
    /// Build an actuator dispatching through `caller`.
    pub fn new(caller: Arc<dyn Caller>) -> Self {
        Self {
            caller,
            index: 1,
            first_index: 1,
            queue: BTreeMap::new(),
            events: BTreeMap::new(),
            event_expiration: DEFAULT_EVENT_EXPIRATION,
        }
    }

    /// Enqueue a task and return its assigned id.
    pub fn push(&mut self, task: Task) -> Ttid {
        let ttid = self.index;
        self.index += 1;
        self.queue.insert(
            ttid,
            QueuedTask {
                task,
                attempts: 0,
                next_attempt_at: Utc::now(),
            },
        );
        ttid
    }

    /// Replace a queued task that has not yet started. The replacement is
    /// assigned a fresh id.
    pub fn update(&mut self, ttid: Ttid, task: Task) -> Result<Ttid, ActuatorError> {
        match self.queue.get(&ttid) {
            None => Err(ActuatorError::TaskNotFound(ttid)),
            Some(queued) if queued.attempts > 0 => Err(ActuatorError::TaskStarted(ttid)),
            Some(_) => {
                self.queue.remove(&ttid);
                Ok(self.push(task))
            }
        }
    }

    /// Drop a queued task that has not yet started. Returns the id when the
    /// task was removed, `None` when there was nothing removable.
    pub fn remove(&mut self, ttid: Ttid) -> Option<Ttid> {
        match self.queue.get(&ttid) {
            Some(queued) if queued.attempts == 0 => {
                self.queue.remove(&ttid);
                Some(ttid)
            }
            _ => None,
        }
    }

    /// Drop every queued task owned by `toid`, started or not, so a
    /// finished order stops consuming attempts. Returns the dropped ids.
    pub fn remove_by_oid(&mut self, toid: Toid) -> Vec<Ttid> {
        let victims: Vec<Ttid> = self
            .queue
            .iter()
            .filter(|(_, queued)| queued.task.toid == Some(toid))
            .map(|(ttid, _)| *ttid)
            .collect();
        for ttid in &victims {
            self.queue.remove(ttid);
        }
        victims
    }

    /// Execute one scheduling pass.
    ///
    /// Every queued task whose prerequisite ids are completed and whose
    /// recall time has arrived is attempted once, in id order. Returns the
    /// completions produced by this pass, in the same order.
    pub async fn run(&mut self) -> Vec<TaskCompletion> {
        let now = Utc::now();
        let ready: Vec<Ttid> = self
            .queue
            .iter()
            .filter(|(_, queued)| {
                queued.next_attempt_at <= now
                    && queued
                        .task
                        .pre_ttids
                        .iter()
                        .all(|pre| self.is_completed(*pre))
            })
            .map(|(ttid, _)| *ttid)
            .collect();

        let caller = Arc::clone(&self.caller);
        let mut completions = Vec::new();

        for ttid in ready {
            let Some(mut queued) = self.queue.remove(&ttid) else {
                continue;
            };
            queued.attempts += 1;

            match caller.call(&queued.task).await {
                Ok(receipt) => {
                    completions.push(self.finish(ttid, queued, TaskStatus::Done, receipt));
                }
                Err(CallFault::Unknown(message)) => {
                    // Indeterminate outcome: retrying could double-apply.
                    let receipt = json!({ "error": message });
                    completions.push(self.finish(ttid, queued, TaskStatus::Unknown, receipt));
                }
                Err(CallFault::Failed(message)) => {
                    if queued.attempts >= queued.task.attempts_max {
                        let receipt = json!({ "error": message });
                        completions.push(self.finish(ttid, queued, TaskStatus::Error, receipt));
                    } else {
                        tracing::debug!(
                            ttid,
                            attempt = queued.attempts,
                            attempts_max = queued.task.attempts_max,
                            "task attempt failed, will recall"
                        );
                        queued.next_attempt_at = deadline_after(now, queued.task.recall_interval);
                        self.queue.insert(ttid, queued);
                    }
                }
            }
        }

        completions
    }

    /// Whether `ttid` has finished (or was already garbage collected).
    pub fn is_completed(&self, ttid: Ttid) -> bool {
        ttid < self.first_index || self.events.contains_key(&ttid)
    }

    /// The completion record for a finished task.
    pub fn get_task_event(&self, ttid: Ttid) -> Option<&TaskEvent> {
        self.events.get(&ttid)
    }

    /// Next id to be allocated.
    pub fn index(&self) -> Ttid {
        self.index
    }

    /// Smallest id that has not been garbage collected.
    pub fn first_index(&self) -> Ttid {
        self.first_index
    }

    /// Number of queued (unfinished) tasks.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Number of queued tasks owned by `toid`.
    pub fn pending_for_order(&self, toid: Toid) -> usize {
        self.queue
            .values()
            .filter(|queued| queued.task.toid == Some(toid))
            .count()
    }

    /// Override the retention period used by [`Self::clear`].
    pub fn set_expiration(&mut self, expiration: Duration) {
        self.event_expiration = expiration;
    }

    /// Sweep finished events from `first_index` upward.
    ///
    /// An empty slot advances the pointer unless the task is still queued.
    /// An occupied slot is deleted when it has expired and either `del_exc`
    /// is set or the task ended `Done`; the sweep stops at the first slot
    /// it must retain.
    pub fn clear(&mut self, expiration: Option<Duration>, del_exc: bool) {
        let expiration = expiration.unwrap_or(self.event_expiration);
        let now = Utc::now();
        while self.first_index < self.index {
            let deletable = match self.events.get(&self.first_index) {
                None => {
                    if self.queue.contains_key(&self.first_index) {
                        break;
                    }
                    self.first_index += 1;
                    continue;
                }
                Some(event) => {
                    let expired = now > deadline_after(event.time, expiration);
                    expired && (del_exc || event.status == TaskStatus::Done)
                }
            };
            if !deletable {
                break;
            }
            self.events.remove(&self.first_index);
            self.first_index += 1;
        }
        tracing::debug!(first_index = self.first_index, "task event sweep finished");
    }

    /// Snapshot all state except the caller.
    pub fn get_data(&self) -> ActuatorData {
        ActuatorData {
            index: self.index,
            first_index: self.first_index,
            queue: self.queue.iter().map(|(k, v)| (*k, v.clone())).collect(),
            events: self.events.iter().map(|(k, v)| (*k, v.clone())).collect(),
            event_expiration: self.event_expiration,
        }
    }

    /// Replace all state from a snapshot. The caller is kept as constructed.
    pub fn set_data(&mut self, data: ActuatorData) {
        self.index = data.index;
        self.first_index = data.first_index;
        self.queue = data.queue.into_iter().collect();
        self.events = data.events.into_iter().collect();
        self.event_expiration = data.event_expiration;
    }

    /// Move a finished task into the event log and build its completion.
    fn finish(
        &mut self,
        ttid: Ttid,
        queued: QueuedTask,
        status: TaskStatus,
        receipt: Value,
    ) -> TaskCompletion {
        tracing::debug!(ttid, status = %status, attempts = queued.attempts, "task finished");
        self.events.insert(
            ttid,
            TaskEvent {
                ttid,
                toid: queued.task.toid,
                task: queued.task.clone(),
                attempts: queued.attempts,
                status,
                receipt: receipt.clone(),
                time: Utc::now(),
            },
        );
        TaskCompletion {
            ttid,
            task: queued.task,
            status,
            receipt,
        }
    }
}

impl std::fmt::Debug for Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actuator")
            .field("index", &self.index)
            .field("first_index", &self.first_index)
            .field("queued", &self.queue.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// `at + interval`, saturating at the far end of the calendar.
fn deadline_after(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
