//! Error type for governance precondition violations.
//!
//! Operational failure (a task erroring out, a phase resolving `No`) is
//! never an error at this surface; it flows through order status. Errors
//! here mean the host called an operation whose contract was not met, and
//! nothing was mutated.

use thiserror::Error;

use accord_actuator::{ActuatorError, Toid, Ttid};

use crate::model::OrderStatus;

/// A rejected transaction-manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TmError {
    /// No order carries this id (never created, or garbage collected).
    #[error("order {0} not found")]
    OrderNotFound(Toid),
    /// The order's gate is closed; open it before modifying participants.
    #[error("order {0} is not open for changes")]
    GateClosed(Toid),
    /// The order already reached `Done` or `Aborted`.
    #[error("order {0} is already finalized")]
    OrderFinalized(Toid),
    /// `push` only works on an order that has not started; use `append`
    /// for in-flight orders.
    #[error("order {0} has already started")]
    OrderStarted(Toid),
    /// The order is mid-phase (committing or compensating); its gate can
    /// only reopen once it settles in `Blocking` or earlier.
    #[error("order {0} is mid-phase and cannot be reopened")]
    OrderInFlight(Toid),
    /// The order has no participant with this prepare id.
    #[error("order {toid} has no participant with prepare id {ttid}")]
    ParticipantNotFound { toid: Toid, ttid: Ttid },
    /// The participant's prepare already completed and can no longer be
    /// replaced.
    #[error("participant {ttid} of order {toid} has already completed")]
    ParticipantCompleted { toid: Toid, ttid: Ttid },
    /// Compensations only apply to participants whose prepare finished
    /// `Done` (there is nothing to undo otherwise).
    #[error("participant {ttid} of order {toid} has not completed successfully")]
    ParticipantNotDone { toid: Toid, ttid: Ttid },
    /// At most one compensation may exist per participant.
    #[error("participant {ttid} of order {toid} already has a compensation")]
    CompensationExists { toid: Toid, ttid: Ttid },
    /// `complete` only accepts `Done` or `Aborted` as its target.
    #[error("completion target must be done or aborted, got {0}")]
    InvalidTarget(OrderStatus),
    /// The actuator rejected the underlying task operation.
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
}
