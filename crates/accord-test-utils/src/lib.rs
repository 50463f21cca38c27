//! Shared test plumbing: a scriptable caller and participant builders.
//!
//! `MockCaller` resolves every call by `(callee, call_type)`. Tests script
//! outcomes per key; unscripted calls succeed with `{"ok": true}`. Every
//! call is recorded so tests can assert on dispatch order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use accord_actuator::{CallFault, Caller, Task};
use accord_core::{NewParticipant, Toid, TransactionManager};

/// A caller whose outcomes are scripted per `(callee, call_type)`.
#[derive(Default)]
pub struct MockCaller {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, CallFault>>>>,
    log: Mutex<Vec<String>>,
}

impl MockCaller {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(callee: &str, call_type: &str) -> String {
        format!("{callee}:{call_type}")
    }

    /// Queue one outcome for the next call matching `(callee, call_type)`.
    pub fn script(&self, callee: &str, call_type: &str, outcome: Result<Value, CallFault>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(Self::key(callee, call_type))
            .or_default()
            .push_back(outcome);
    }

    /// Queue `n` definite failures for `(callee, call_type)`.
    pub fn fail_times(&self, callee: &str, call_type: &str, n: u32) {
        for _ in 0..n {
            self.script(
                callee,
                call_type,
                Err(CallFault::Failed("scripted failure".into())),
            );
        }
    }

    /// Queue one indeterminate outcome for `(callee, call_type)`.
    pub fn lose_reply(&self, callee: &str, call_type: &str) {
        self.script(
            callee,
            call_type,
            Err(CallFault::Unknown("scripted lost reply".into())),
        );
    }

    /// Every `(callee, call_type)` dispatched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// How often `(callee, call_type)` was dispatched.
    pub fn call_count(&self, callee: &str, call_type: &str) -> usize {
        let key = Self::key(callee, call_type);
        self.log.lock().unwrap().iter().filter(|k| **k == key).count()
    }
}

#[async_trait]
impl Caller for MockCaller {
    async fn call(&self, task: &Task) -> Result<Value, CallFault> {
        let key = Self::key(&task.callee, &task.call_type);
        self.log.lock().unwrap().push(key.clone());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(json!({"ok": true})))
    }
}

/// A task for `callee` with a small retry budget and no recall delay, so
/// tests converge in a handful of passes.
pub fn call_task(callee: &str, call_type: &str) -> Task {
    Task::new(callee, call_type, json!({})).with_retry(2, Duration::ZERO)
}

/// A participant whose prepare and commit target `callee`.
pub fn participant(callee: &str) -> NewParticipant {
    NewParticipant::new(call_task(callee, "prepare"), call_task(callee, "commit"))
}

/// A participant with a compensation as well.
pub fn participant_with_comp(callee: &str) -> NewParticipant {
    participant(callee).with_comp(call_task(callee, "compensate"))
}

/// Run the manager until the actuator has no queued tasks left, with a
/// pass bound so a misbehaving test fails instead of spinning.
pub async fn drive_to_idle(tm: &mut TransactionManager, toid: Toid) -> anyhow::Result<()> {
    for _ in 0..32 {
        tm.run(toid).await?;
        if tm.actuator().pending_count() == 0 {
            return Ok(());
        }
    }
    anyhow::bail!("actuator did not quiesce within 32 passes")
}
