//! The `Caller` trait -- the host-side dispatcher the actuator calls through.
//!
//! The actuator never talks to a transport itself; every attempt of every
//! task goes through a host-supplied implementation of this trait, which
//! routes on `callee` and `call_type`. The trait is intentionally
//! object-safe so the actuator can hold it as `Arc<dyn Caller>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::Task;

/// How a call attempt failed.
///
/// The distinction matters for retries: a `Failed` call definitely did not
/// take effect and may be re-attempted; an `Unknown` outcome may or may not
/// have taken effect, so the actuator finishes the task as `Unknown` instead
/// of blindly retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CallFault {
    /// The call was rejected or errored; it did not take effect.
    #[error("call failed: {0}")]
    Failed(String),
    /// The outcome of the call cannot be determined.
    #[error("call outcome unknown: {0}")]
    Unknown(String),
}

/// Host-side dispatcher for task invocations.
///
/// Implementors resolve `task.callee` / `task.call_type` to an in-process
/// handler or a remote endpoint, pass `task.data` (and `task.budget`)
/// through, and return the participant's receipt.
#[async_trait]
pub trait Caller: Send + Sync {
    /// Invoke one attempt of `task`, returning the participant's receipt.
    async fn call(&self, task: &Task) -> Result<Value, CallFault>;
}

// Compile-time assertion: Caller must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Caller) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A trivial caller that acknowledges everything, used only to prove
    /// the trait can be implemented and used as `dyn Caller`.
    struct NoopCaller;

    #[async_trait]
    impl Caller for NoopCaller {
        async fn call(&self, _task: &Task) -> Result<Value, CallFault> {
            Ok(json!({"ok": true}))
        }
    }

    #[test]
    fn caller_is_object_safe() {
        // If this compiles, the trait is object-safe.
        let _caller: Box<dyn Caller> = Box::new(NoopCaller);
    }

    #[tokio::test]
    async fn noop_caller_acknowledges() {
        let caller: Box<dyn Caller> = Box::new(NoopCaller);
        let task = Task::new("anyone", "prepare", Value::Null);
        let receipt = caller.call(&task).await.expect("noop call succeeds");
        assert_eq!(receipt, json!({"ok": true}));
    }

    #[test]
    fn fault_display() {
        let failed = CallFault::Failed("boom".into());
        assert_eq!(failed.to_string(), "call failed: boom");
        let unknown = CallFault::Unknown("timeout".into());
        assert_eq!(unknown.to_string(), "call outcome unknown: timeout");
    }
}
