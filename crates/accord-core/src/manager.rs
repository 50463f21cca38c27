//! The transaction manager: drives orders through prepare, commit, and
//! compensate, reacting to task completions drained from the actuator.
//!
//! The manager is a plain `&mut self` structure; the exclusive borrow is
//! what serializes all state mutation. Suspension only happens at actuator
//! passes and host hooks, and every phase decision uses the order status
//! and gate snapshotted before the triggering event was applied. A host
//! that needs shared access wraps the manager in its own single-consumer
//! task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use accord_actuator::{
    Actuator, Caller, Task, TaskCompletion, TaskEvent, TaskStatus, Tcid, Toid, Ttid,
};

use crate::aggregate::order_phase;
use crate::error::TmError;
use crate::hooks::{HookRouter, OrderHook, TaskHook, noop_order_hook, noop_task_hook};
use crate::model::{
    CommitTask, Compensation, Gate, Order, OrderStatus, Participant, Phase, PhaseResult,
};
use crate::snapshot::TmData;
use crate::store::{OrderPage, OrderStore};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parameters for registering one participant via `push` or `append`.
pub struct NewParticipant {
    /// The vote call, registered with the actuator immediately.
    pub prepare: Task,
    /// The apply call, held back until the prepare phase resolves `Yes`.
    pub commit: Task,
    /// The undo call, held back until the compensate phase opens.
    pub comp: Option<Task>,
    /// Hook fired when the prepare completes.
    pub on_prepare: Option<TaskHook>,
    /// Hook fired when the commit completes (parked until fan-out).
    pub on_commit: Option<TaskHook>,
}

impl NewParticipant {
    pub fn new(prepare: Task, commit: Task) -> Self {
        Self {
            prepare,
            commit,
            comp: None,
            on_prepare: None,
            on_commit: None,
        }
    }

    pub fn with_comp(mut self, comp: Task) -> Self {
        self.comp = Some(comp);
        self
    }

    pub fn with_on_prepare(mut self, hook: TaskHook) -> Self {
        self.on_prepare = Some(hook);
        self
    }

    pub fn with_on_commit(mut self, hook: TaskHook) -> Self {
        self.on_commit = Some(hook);
        self
    }
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

/// Coordinates multi-participant orders over the actuator.
pub struct TransactionManager {
    actuator: Actuator,
    store: OrderStore,
    hooks: HookRouter,
}

impl TransactionManager {
    /// Build a manager with no-op default hooks.
    pub fn new(caller: Arc<dyn Caller>) -> Self {
        Self::with_defaults(caller, noop_task_hook(), noop_order_hook())
    }

    /// Build a manager with process-wide default hooks, fired whenever no
    /// per-id hook is registered.
    pub fn with_defaults(
        caller: Arc<dyn Caller>,
        default_task: TaskHook,
        default_order: OrderHook,
    ) -> Self {
        Self {
            actuator: Actuator::new(caller),
            store: OrderStore::new(),
            hooks: HookRouter::new(default_task, default_order),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Create an empty order. Returns its id.
    pub fn create(&mut self, data: Option<Value>, on_complete: Option<OrderHook>) -> Toid {
        let toid = self.store.create(data);
        if let Some(hook) = on_complete {
            self.hooks.set_order_hook(toid, hook);
        }
        tracing::info!(toid, "order created");
        toid
    }

    /// Register a participant on an order that has not started yet.
    ///
    /// The prepare is pushed to the actuator now; commit and compensation
    /// are held back for their phases.
    pub fn push(&mut self, toid: Toid, participant: NewParticipant) -> Result<Ttid, TmError> {
        let status = self.gate_check(toid)?;
        if status != OrderStatus::Todo {
            return Err(TmError::OrderStarted(toid));
        }
        self.admit_participant(toid, participant)
    }

    /// Register a participant on an in-flight order (gate must be open).
    pub fn append(&mut self, toid: Toid, participant: NewParticipant) -> Result<Ttid, TmError> {
        self.gate_check(toid)?;
        self.admit_participant(toid, participant)
    }

    /// Reopen an order's gate for participant changes.
    ///
    /// Refused while a phase fan-out is in flight: an open gate is only
    /// consistent with `Todo`, `Preparing`, and `Blocking`.
    pub fn open(&mut self, toid: Toid) -> Result<(), TmError> {
        {
            let Some(order) = self.store.get(toid) else {
                return Err(TmError::OrderNotFound(toid));
            };
            if matches!(
                order.status,
                OrderStatus::Committing | OrderStatus::Compensating
            ) {
                return Err(TmError::OrderInFlight(toid));
            }
        }
        self.set_gate(toid, Gate::Opening)
    }

    /// Close an order's gate. Required before any phase outcome can move
    /// the order. Idempotent.
    pub fn finish(&mut self, toid: Toid) -> Result<(), TmError> {
        self.set_gate(toid, Gate::Closed)
    }

    /// Start an order (`Todo` becomes `Preparing`) and run one actuator
    /// pass, folding every completion into order state. Returns the number
    /// of completions processed; hosts call this until the actuator
    /// quiesces.
    ///
    /// `run` is itself a state-machine trigger: after the pass the order is
    /// re-evaluated, which picks up completions that arrived while the
    /// gate was still open.
    pub async fn run(&mut self, toid: Toid) -> Result<usize, TmError> {
        {
            let Some(order) = self.store.get_mut(toid) else {
                return Err(TmError::OrderNotFound(toid));
            };
            if order.status == OrderStatus::Todo {
                order.status = OrderStatus::Preparing;
                tracing::info!(toid, "order preparing");
            }
        }
        let completions = self.actuator.run().await;
        let count = completions.len();
        for completion in completions {
            self.task_callback_proxy(completion).await;
        }

        let snapshot = self.store.get(toid).map(|order| (order.status, order.gate));
        if let Some((status, Gate::Closed)) = snapshot {
            if let Some(terminal) = self.transition(toid, status) {
                self.order_complete(toid, terminal).await;
            }
        }
        Ok(count)
    }

    // -- governance ---------------------------------------------------------

    /// Replace a participant whose prepare has not completed. The prepare
    /// is reassigned a fresh id; old per-id hooks are cleared.
    pub fn update(
        &mut self,
        toid: Toid,
        ttid: Ttid,
        participant: NewParticipant,
    ) -> Result<Ttid, TmError> {
        self.gate_check(toid)?;
        {
            let Some(order) = self.store.get(toid) else {
                return Err(TmError::OrderNotFound(toid));
            };
            let Some(current) = order.participant(ttid) else {
                return Err(TmError::ParticipantNotFound { toid, ttid });
            };
            if current.status.is_final() || self.actuator.is_completed(ttid) {
                return Err(TmError::ParticipantCompleted { toid, ttid });
            }
        }

        let NewParticipant {
            mut prepare,
            mut commit,
            mut comp,
            on_prepare,
            on_commit,
        } = participant;
        prepare.toid = Some(toid);
        prepare.time = Utc::now();
        let new_ttid = self.actuator.update(ttid, prepare.clone())?;
        commit.toid = Some(toid);
        commit.for_ttid = Some(new_ttid);
        if let Some(task) = comp.as_mut() {
            task.toid = Some(toid);
            task.for_ttid = Some(new_ttid);
        }

        self.hooks.clear_task_hook(ttid);
        if let Some(order) = self.store.get_mut(toid) {
            if let Some(slot) = order.participants.iter_mut().find(|p| p.ttid == ttid) {
                *slot = Participant {
                    ttid: new_ttid,
                    prepare,
                    commit,
                    comp,
                    status: TaskStatus::Todo,
                };
            }
        }
        if let Some(hook) = on_prepare {
            self.hooks.set_task_hook(new_ttid, hook);
        }
        if let Some(hook) = on_commit {
            self.hooks.park_commit_hook(new_ttid, hook);
        }
        tracing::info!(toid, old = ttid, new = new_ttid, "participant replaced");
        Ok(new_ttid)
    }

    /// Cancel a participant whose prepare has not started. Returns the
    /// removed id, or `None` when there was nothing removable.
    pub fn remove(&mut self, toid: Toid, ttid: Ttid) -> Result<Option<Ttid>, TmError> {
        self.gate_check(toid)?;
        {
            let Some(order) = self.store.get(toid) else {
                return Err(TmError::OrderNotFound(toid));
            };
            let Some(current) = order.participant(ttid) else {
                return Ok(None);
            };
            if current.status.is_final() || self.actuator.is_completed(ttid) {
                return Ok(None);
            }
        }
        if self.actuator.remove(ttid).is_none() {
            return Ok(None);
        }
        self.hooks.clear_task_hook(ttid);
        let emptied = match self.store.get_mut(toid) {
            Some(order) => {
                order.participants.retain(|p| p.ttid != ttid);
                order.participants.is_empty()
            }
            None => false,
        };
        if emptied {
            self.store.retire(toid);
        }
        tracing::info!(toid, ttid, "participant removed");
        Ok(Some(ttid))
    }

    /// Inject a compensation for a participant whose prepare finished
    /// `Done`. The task is pushed to the actuator immediately, so a
    /// blocked order can run its recovery before being forced terminal.
    pub fn append_comp(
        &mut self,
        toid: Toid,
        for_ttid: Ttid,
        comp: Task,
        on_comp: Option<TaskHook>,
    ) -> Result<Tcid, TmError> {
        self.gate_check(toid)?;
        {
            let Some(order) = self.store.get(toid) else {
                return Err(TmError::OrderNotFound(toid));
            };
            let Some(participant) = order.participant(for_ttid) else {
                return Err(TmError::ParticipantNotFound {
                    toid,
                    ttid: for_ttid,
                });
            };
            if participant.status != TaskStatus::Done {
                return Err(TmError::ParticipantNotDone {
                    toid,
                    ttid: for_ttid,
                });
            }
            if order.has_compensation_for(for_ttid) {
                return Err(TmError::CompensationExists {
                    toid,
                    ttid: for_ttid,
                });
            }
        }

        let mut task = comp;
        task.toid = Some(toid);
        task.for_ttid = Some(for_ttid);
        task.time = Utc::now();
        let tcid = self.actuator.push(task.clone());
        if let Some(hook) = on_comp {
            self.hooks.set_task_hook(tcid, hook);
        }
        if let Some(order) = self.store.get_mut(toid) {
            order.compensations.push(Compensation {
                tcid,
                for_ttid,
                task,
                status: TaskStatus::Todo,
            });
        }
        tracing::info!(toid, for_ttid, tcid, "compensation appended");
        Ok(tcid)
    }

    /// Force a blocked order to a terminal status.
    ///
    /// `target` must be `Done` or `Aborted`. Succeeds only when the order
    /// is `Blocking` with a closed gate and the phase backing the target
    /// (commit for `Done`, compensate for `Aborted`) aggregates `Yes`;
    /// returns `Ok(false)` otherwise.
    pub async fn complete(&mut self, toid: Toid, target: OrderStatus) -> Result<bool, TmError> {
        let phase = match target {
            OrderStatus::Done => Phase::Commit,
            OrderStatus::Aborted => Phase::Compensate,
            other => return Err(TmError::InvalidTarget(other)),
        };
        let Some(order) = self.store.get(toid) else {
            return Err(TmError::OrderNotFound(toid));
        };
        if order.status != OrderStatus::Blocking || order.gate != Gate::Closed {
            return Ok(false);
        }
        if order_phase(order, phase) != PhaseResult::Yes {
            return Ok(false);
        }
        tracing::info!(toid, target = %target, "blocked order forced terminal");
        self.order_complete(toid, target).await;
        Ok(true)
    }

    // -- queries ------------------------------------------------------------

    /// Number of retained orders.
    pub fn count(&self) -> usize {
        self.store.count()
    }

    pub fn status(&self, toid: Toid) -> Option<OrderStatus> {
        self.store.get(toid).map(|order| order.status)
    }

    /// Whether the order reached a terminal status.
    pub fn is_completed(&self, toid: Toid) -> bool {
        self.store
            .get(toid)
            .is_some_and(|order| order.status.is_final())
    }

    pub fn is_task_completed(&self, ttid: Ttid) -> bool {
        self.actuator.is_completed(ttid)
    }

    pub fn get_order(&self, toid: Toid) -> Option<&Order> {
        self.store.get(toid)
    }

    /// A 1-indexed page over the live id range.
    pub fn get_orders(&self, page: usize, size: usize) -> OrderPage {
        self.store.page(page, size)
    }

    /// Orders with at least one participant and a non-terminal status.
    pub fn get_alive_orders(&self) -> &[Toid] {
        self.store.alive()
    }

    /// Aggregate one phase of an order; `None` when the order is unknown.
    pub fn phase(&self, toid: Toid, phase: Phase) -> Option<PhaseResult> {
        self.store.get(toid).map(|order| order_phase(order, phase))
    }

    /// An order's task completions, in delivery order. Events the actuator
    /// has already swept are omitted.
    pub fn get_task_events(&self, toid: Toid) -> Vec<TaskEvent> {
        self.store
            .task_event_log(toid)
            .iter()
            .filter_map(|ttid| self.actuator.get_task_event(*ttid).cloned())
            .collect()
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }

    pub fn actuator_mut(&mut self) -> &mut Actuator {
        &mut self.actuator
    }

    // -- retention & snapshot -----------------------------------------------

    /// Override the retention period for finished orders and task events.
    pub fn set_cache_expiration(&mut self, expiration: Duration) {
        self.store.set_auto_clear_timeout(expiration);
        self.actuator.set_expiration(expiration);
    }

    /// Garbage collect expired orders and task events.
    pub fn clear(&mut self, del_exc: bool) {
        self.store.clear(del_exc);
        self.actuator.clear(None, del_exc);
    }

    /// Snapshot all state except hooks.
    pub fn get_data(&self) -> TmData {
        TmData {
            auto_clear_timeout: self.store.auto_clear_timeout(),
            index: self.store.index(),
            first_index: self.store.first_index(),
            orders: self
                .store
                .orders()
                .map(|(toid, order)| (toid, order.clone()))
                .collect(),
            alive_orders: self.store.alive().to_vec(),
            task_events: self
                .store
                .task_events()
                .map(|(toid, log)| (toid, log.clone()))
                .collect(),
            actuator: self.actuator.get_data(),
        }
    }

    /// Replace all state from a snapshot. Per-id hooks are gone after a
    /// restore; only the defaults fire until the host re-registers them.
    pub fn set_data(&mut self, data: TmData) {
        self.store = OrderStore::from_parts(
            data.auto_clear_timeout,
            data.index,
            data.first_index,
            data.orders,
            data.alive_orders,
            data.task_events,
        );
        self.actuator.set_data(data.actuator);
        tracing::info!(orders = self.store.count(), "state restored from snapshot");
    }

    /// (Re-)register the completion hook for an order, e.g. after a
    /// snapshot restore.
    pub fn set_order_hook(&mut self, toid: Toid, hook: OrderHook) -> Result<(), TmError> {
        let Some(order) = self.store.get(toid) else {
            return Err(TmError::OrderNotFound(toid));
        };
        if order.status.is_final() {
            return Err(TmError::OrderFinalized(toid));
        }
        self.hooks.set_order_hook(toid, hook);
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    /// Governance precondition: the order exists, is not terminal, and its
    /// gate is open. Returns the current status.
    fn gate_check(&self, toid: Toid) -> Result<OrderStatus, TmError> {
        let Some(order) = self.store.get(toid) else {
            return Err(TmError::OrderNotFound(toid));
        };
        if order.status.is_final() {
            return Err(TmError::OrderFinalized(toid));
        }
        if order.gate != Gate::Opening {
            return Err(TmError::GateClosed(toid));
        }
        Ok(order.status)
    }

    fn set_gate(&mut self, toid: Toid, gate: Gate) -> Result<(), TmError> {
        let Some(order) = self.store.get_mut(toid) else {
            return Err(TmError::OrderNotFound(toid));
        };
        if order.status.is_final() {
            return Err(TmError::OrderFinalized(toid));
        }
        order.gate = gate;
        tracing::debug!(toid, gate = %gate, "order gate set");
        Ok(())
    }

    /// Push a participant's prepare and record the triplet on the order.
    fn admit_participant(
        &mut self,
        toid: Toid,
        participant: NewParticipant,
    ) -> Result<Ttid, TmError> {
        let NewParticipant {
            mut prepare,
            mut commit,
            mut comp,
            on_prepare,
            on_commit,
        } = participant;
        prepare.toid = Some(toid);
        prepare.time = Utc::now();
        let ttid = self.actuator.push(prepare.clone());
        commit.toid = Some(toid);
        commit.for_ttid = Some(ttid);
        if let Some(task) = comp.as_mut() {
            task.toid = Some(toid);
            task.for_ttid = Some(ttid);
        }

        let Some(order) = self.store.get_mut(toid) else {
            return Err(TmError::OrderNotFound(toid));
        };
        order.participants.push(Participant {
            ttid,
            prepare,
            commit,
            comp,
            status: TaskStatus::Todo,
        });
        if let Some(hook) = on_prepare {
            self.hooks.set_task_hook(ttid, hook);
        }
        if let Some(hook) = on_commit {
            self.hooks.park_commit_hook(ttid, hook);
        }
        self.store.mark_alive(toid);
        tracing::info!(toid, ttid, "participant registered");
        Ok(ttid)
    }

    /// Fold one task completion into order state.
    ///
    /// 1. Snapshot the owning order's status and gate before mutation.
    /// 2. Apply the status to whichever record matches the id.
    /// 3. Fire the task hook (per-id entry consumed on use).
    /// 4. Consult the aggregator and apply the transition table.
    /// 5. Log the event; if the order terminalized, finish it last so the
    ///    order hook observes completed bookkeeping.
    async fn task_callback_proxy(&mut self, completion: TaskCompletion) {
        let pre = completion
            .task
            .toid
            .and_then(|toid| self.store.get(toid).map(|o| (toid, o.status, o.gate)));

        if let Some((toid, _, _)) = pre {
            if let Some(order) = self.store.get_mut(toid) {
                apply_completion(order, &completion);
            }
        }

        self.hooks.fire_task(&completion).await;

        // An unknown or garbage-collected order leaves no bookkeeping.
        let Some((toid, pre_status, pre_gate)) = pre else {
            return;
        };

        let outcome = if pre_gate == Gate::Closed {
            self.transition(toid, pre_status)
        } else {
            None
        };

        self.store.log_task_event(toid, completion.ttid);

        if let Some(status) = outcome {
            self.order_complete(toid, status).await;
        }
    }

    /// Apply the order transition table for the pre-event status. Returns
    /// the terminal status to enter, if any. Fan-outs happen here, without
    /// suspension.
    fn transition(&mut self, toid: Toid, pre_status: OrderStatus) -> Option<OrderStatus> {
        match pre_status {
            OrderStatus::Preparing => {
                match order_phase(self.store.get(toid)?, Phase::Prepare) {
                    PhaseResult::Yes => {
                        self.begin_commit(toid);
                        // A commit phase with no work is vacuously done.
                        self.phase_is_yes(toid, Phase::Commit)
                            .then_some(OrderStatus::Done)
                    }
                    PhaseResult::No => {
                        self.begin_compensate(toid);
                        // No participant needed undoing: abort right away.
                        self.phase_is_yes(toid, Phase::Compensate)
                            .then_some(OrderStatus::Aborted)
                    }
                    PhaseResult::Doing => None,
                }
            }
            OrderStatus::Committing => match order_phase(self.store.get(toid)?, Phase::Commit) {
                PhaseResult::Yes => Some(OrderStatus::Done),
                PhaseResult::No => {
                    self.block(toid);
                    None
                }
                PhaseResult::Doing => None,
            },
            OrderStatus::Compensating => {
                match order_phase(self.store.get(toid)?, Phase::Compensate) {
                    PhaseResult::Yes => Some(OrderStatus::Aborted),
                    PhaseResult::No => {
                        self.block(toid);
                        None
                    }
                    PhaseResult::Doing => None,
                }
            }
            _ => None,
        }
    }

    fn phase_is_yes(&self, toid: Toid, phase: Phase) -> bool {
        self.store
            .get(toid)
            .is_some_and(|order| order_phase(order, phase) == PhaseResult::Yes)
    }

    /// Commit fan-out: push every participant's commit and promote parked
    /// commit hooks to the assigned ids. Commits carry no prerequisite
    /// edges; they are independent under two-phase commit.
    fn begin_commit(&mut self, toid: Toid) {
        let pending: Vec<(Ttid, Task)> = match self.store.get_mut(toid) {
            Some(order) => {
                order.status = OrderStatus::Committing;
                order
                    .participants
                    .iter()
                    .map(|p| (p.ttid, p.commit.clone()))
                    .collect()
            }
            None => return,
        };

        let mut records = Vec::with_capacity(pending.len());
        for (prepare_ttid, mut task) in pending {
            task.time = Utc::now();
            let cid = self.actuator.push(task.clone());
            self.hooks.promote_commit_hook(prepare_ttid, cid);
            records.push(CommitTask {
                ttid: cid,
                task,
                prepare_ttid,
                status: TaskStatus::Todo,
            });
        }

        if let Some(order) = self.store.get_mut(toid) {
            order.commits.extend(records);
        }
        tracing::info!(toid, "prepare phase accepted, committing");
    }

    /// Compensate fan-out: push the compensation of every participant
    /// whose prepare finished `Done`. Participants that never prepared
    /// have nothing to undo.
    fn begin_compensate(&mut self, toid: Toid) {
        let pending: Vec<(Ttid, Task)> = match self.store.get_mut(toid) {
            Some(order) => {
                order.status = OrderStatus::Compensating;
                order
                    .participants
                    .iter()
                    .filter(|p| p.status == TaskStatus::Done)
                    .filter_map(|p| p.comp.clone().map(|task| (p.ttid, task)))
                    .collect()
            }
            None => return,
        };

        let mut records = Vec::with_capacity(pending.len());
        for (for_ttid, mut task) in pending {
            task.time = Utc::now();
            let tcid = self.actuator.push(task.clone());
            records.push(Compensation {
                tcid,
                for_ttid,
                task,
                status: TaskStatus::Todo,
            });
        }

        if let Some(order) = self.store.get_mut(toid) {
            order.compensations.extend(records);
        }
        tracing::warn!(toid, "prepare phase rejected, compensating");
    }

    fn block(&mut self, toid: Toid) {
        if let Some(order) = self.store.get_mut(toid) {
            order.status = OrderStatus::Blocking;
            tracing::warn!(toid, "order blocked, operator intervention required");
        }
    }

    /// Terminalize an order: set the status, drop per-id hooks and
    /// outstanding actuator tasks, retire it from the alive list, then
    /// fire the order hook and record how it ended.
    async fn order_complete(&mut self, toid: Toid, status: OrderStatus) {
        let (data, ids) = {
            let Some(order) = self.store.get_mut(toid) else {
                return;
            };
            order.status = status;
            let ids: Vec<Ttid> = order
                .participants
                .iter()
                .map(|p| p.ttid)
                .chain(order.commits.iter().map(|c| c.ttid))
                .chain(order.compensations.iter().map(|c| c.tcid))
                .collect();
            (order.data.clone(), ids)
        };

        for ttid in ids {
            self.hooks.clear_task_hook(ttid);
        }
        self.actuator.remove_by_oid(toid);
        self.store.retire(toid);
        tracing::info!(toid, status = %status, "order complete");

        let callback_status = self.hooks.fire_order(toid, status, data).await;
        if let Some(order) = self.store.get_mut(toid) {
            order.callback_status = Some(callback_status);
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("orders", &self.store.count())
            .field("alive", &self.store.alive().len())
            .field("actuator", &self.actuator)
            .finish()
    }
}

/// Apply a completion's status to whichever record carries the id. The id
/// spaces are disjoint (one allocator), so the first match wins.
fn apply_completion(order: &mut Order, completion: &TaskCompletion) {
    if let Some(p) = order
        .participants
        .iter_mut()
        .find(|p| p.ttid == completion.ttid)
    {
        p.status = completion.status;
        return;
    }
    if let Some(c) = order.commits.iter_mut().find(|c| c.ttid == completion.ttid) {
        c.status = completion.status;
        return;
    }
    if let Some(c) = order
        .compensations
        .iter_mut()
        .find(|c| c.tcid == completion.ttid)
    {
        c.status = completion.status;
    }
}
