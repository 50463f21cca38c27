//! Callback routing: per-task and per-order completion hooks with
//! process-wide defaults.
//!
//! Per-id hooks fire exactly once and are removed on use; the defaults,
//! supplied at construction, are never removed. A hook that fails must not
//! disturb task progression, so failures are logged and swallowed (for
//! order hooks the failure is reported back so the order can record it).
//! Hooks reference host closures and are deliberately excluded from
//! snapshots; after a restore only the defaults fire until the host
//! re-registers per-id hooks.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use accord_actuator::{TaskCompletion, TaskStatus, Toid, Ttid};

use crate::model::OrderStatus;

/// Host hook fired when a task completes.
pub type TaskHook =
    Arc<dyn Fn(TaskCompletion) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Host hook fired when an order terminalizes.
pub type OrderHook = Arc<
    dyn Fn(Toid, OrderStatus, Option<Value>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// A task hook that does nothing.
pub fn noop_task_hook() -> TaskHook {
    Arc::new(|_| Box::pin(async { Ok(()) }))
}

/// An order hook that does nothing.
pub fn noop_order_hook() -> OrderHook {
    Arc::new(|_, _, _| Box::pin(async { Ok(()) }))
}

/// Routes completions to the right hook.
pub struct HookRouter {
    /// Fires once when the task with this id completes.
    task: HashMap<Ttid, TaskHook>,
    /// Parked at push time under the *prepare* id; promoted to the
    /// commit's own id at commit fan-out.
    parked_commit: HashMap<Ttid, TaskHook>,
    /// Fires once when the order terminalizes.
    order: HashMap<Toid, OrderHook>,
    default_task: TaskHook,
    default_order: OrderHook,
}

impl HookRouter {
    pub fn new(default_task: TaskHook, default_order: OrderHook) -> Self {
        Self {
            task: HashMap::new(),
            parked_commit: HashMap::new(),
            order: HashMap::new(),
            default_task,
            default_order,
        }
    }

    /// Register a hook for one task id, replacing any previous entry.
    pub fn set_task_hook(&mut self, ttid: Ttid, hook: TaskHook) {
        self.task.insert(ttid, hook);
    }

    /// Park a commit hook under its prepare id until fan-out assigns the
    /// commit's own id.
    pub fn park_commit_hook(&mut self, prepare_ttid: Ttid, hook: TaskHook) {
        self.parked_commit.insert(prepare_ttid, hook);
    }

    /// Move a parked commit hook to the commit's assigned id.
    pub fn promote_commit_hook(&mut self, prepare_ttid: Ttid, commit_ttid: Ttid) {
        if let Some(hook) = self.parked_commit.remove(&prepare_ttid) {
            self.task.insert(commit_ttid, hook);
        }
    }

    /// Register a hook for one order id, replacing any previous entry.
    pub fn set_order_hook(&mut self, toid: Toid, hook: OrderHook) {
        self.order.insert(toid, hook);
    }

    /// Drop any per-task registrations for this id.
    pub fn clear_task_hook(&mut self, ttid: Ttid) {
        self.task.remove(&ttid);
        self.parked_commit.remove(&ttid);
    }

    /// Drop the per-order registration for this id.
    pub fn clear_order_hook(&mut self, toid: Toid) {
        self.order.remove(&toid);
    }

    /// Fire the per-id task hook if registered (removing it), else the
    /// default. Failures are logged and swallowed.
    pub async fn fire_task(&mut self, completion: &TaskCompletion) {
        let hook = self
            .task
            .remove(&completion.ttid)
            .unwrap_or_else(|| Arc::clone(&self.default_task));
        if let Err(error) = hook(completion.clone()).await {
            tracing::warn!(
                ttid = completion.ttid,
                error = %error,
                "task hook failed"
            );
        }
    }

    /// Fire the per-id order hook if registered (removing it), else the
    /// default. Returns how the hook ended so the order can record it.
    pub async fn fire_order(
        &mut self,
        toid: Toid,
        status: OrderStatus,
        data: Option<Value>,
    ) -> TaskStatus {
        let hook = self
            .order
            .remove(&toid)
            .unwrap_or_else(|| Arc::clone(&self.default_order));
        match hook(toid, status, data).await {
            Ok(()) => TaskStatus::Done,
            Err(error) => {
                tracing::warn!(toid, error = %error, "order hook failed");
                TaskStatus::Error
            }
        }
    }
}

impl std::fmt::Debug for HookRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRouter")
            .field("task", &self.task.keys().collect::<Vec<_>>())
            .field("parked_commit", &self.parked_commit.keys().collect::<Vec<_>>())
            .field("order", &self.order.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use accord_actuator::Task;
    use serde_json::json;

    fn completion(ttid: Ttid) -> TaskCompletion {
        TaskCompletion {
            ttid,
            task: Task::new("a", "prepare", Value::Null),
            status: TaskStatus::Done,
            receipt: json!({"ok": true}),
        }
    }

    fn counting_task_hook(counter: Arc<AtomicUsize>) -> TaskHook {
        Arc::new(move |_| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn per_id_hook_fires_once_then_default() {
        let default_hits = Arc::new(AtomicUsize::new(0));
        let per_id_hits = Arc::new(AtomicUsize::new(0));
        let mut router = HookRouter::new(
            counting_task_hook(Arc::clone(&default_hits)),
            noop_order_hook(),
        );
        router.set_task_hook(7, counting_task_hook(Arc::clone(&per_id_hits)));

        router.fire_task(&completion(7)).await;
        assert_eq!(per_id_hits.load(Ordering::SeqCst), 1);
        assert_eq!(default_hits.load(Ordering::SeqCst), 0);

        // The per-id entry was consumed; the default takes over.
        router.fire_task(&completion(7)).await;
        assert_eq!(per_id_hits.load(Ordering::SeqCst), 1);
        assert_eq!(default_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parked_commit_hook_promotes_to_new_id() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = HookRouter::new(noop_task_hook(), noop_order_hook());
        router.park_commit_hook(1, counting_task_hook(Arc::clone(&hits)));

        router.promote_commit_hook(1, 9);
        router.fire_task(&completion(9)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn promote_without_parked_entry_is_a_noop() {
        let mut router = HookRouter::new(noop_task_hook(), noop_order_hook());
        router.promote_commit_hook(1, 9);
        router.fire_task(&completion(9)).await;
    }

    #[tokio::test]
    async fn failing_task_hook_is_swallowed() {
        let mut router = HookRouter::new(
            Arc::new(|_| Box::pin(async { anyhow::bail!("host bug") })),
            noop_order_hook(),
        );
        // Must not panic or propagate.
        router.fire_task(&completion(1)).await;
    }

    #[tokio::test]
    async fn order_hook_outcome_is_reported() {
        let mut router = HookRouter::new(
            noop_task_hook(),
            Arc::new(|_, _, _| Box::pin(async { anyhow::bail!("host bug") })),
        );
        let status = router.fire_order(1, OrderStatus::Done, None).await;
        assert_eq!(status, TaskStatus::Error);

        router.set_order_hook(2, noop_order_hook());
        let status = router.fire_order(2, OrderStatus::Aborted, None).await;
        assert_eq!(status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn clear_task_hook_drops_both_registrations() {
        let per_id_hits = Arc::new(AtomicUsize::new(0));
        let mut router = HookRouter::new(noop_task_hook(), noop_order_hook());
        router.set_task_hook(3, counting_task_hook(Arc::clone(&per_id_hits)));
        router.park_commit_hook(3, counting_task_hook(Arc::clone(&per_id_hits)));

        router.clear_task_hook(3);
        router.fire_task(&completion(3)).await;
        router.promote_commit_hook(3, 4);
        router.fire_task(&completion(4)).await;
        assert_eq!(per_id_hits.load(Ordering::SeqCst), 0);
    }
}
