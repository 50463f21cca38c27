//! Two-phase commit transaction manager.
//!
//! An *order* groups a set of participants, each contributing an idempotent
//! prepare, commit, and optional compensation call. The
//! [`TransactionManager`] drives every order through the two-phase commit
//! protocol on top of the retrying dispatcher from `accord-actuator`,
//! aggregates per-participant outcomes into an order outcome, routes
//! completion callbacks to the host, and exposes governance operations to
//! unblock stuck orders. All state snapshots into a serializable
//! [`TmData`] for host-managed durability.

pub mod aggregate;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod model;
pub mod snapshot;
pub mod store;

pub use aggregate::{order_phase, phase_result};
pub use error::TmError;
pub use hooks::{HookRouter, OrderHook, TaskHook, noop_order_hook, noop_task_hook};
pub use manager::{NewParticipant, TransactionManager};
pub use model::{
    CommitTask, Compensation, Gate, Order, OrderStatus, Participant, Phase, PhaseResult,
};
pub use snapshot::TmData;
pub use store::{DEFAULT_AUTO_CLEAR_TIMEOUT, OrderPage, OrderStore};

// The actuator-level vocabulary is part of this crate's public surface.
pub use accord_actuator::{
    Actuator, CallFault, Caller, Task, TaskCompletion, TaskEvent, TaskStatus, Tcid, Toid, Ttid,
};
