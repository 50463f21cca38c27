//! Serializable snapshot of all transaction-manager state.
//!
//! The host owns durability: it serializes [`TmData`] however it likes and
//! hands it back through `set_data` after a restart. Hook maps are never
//! part of the snapshot (they hold host closures); only the process-wide
//! default hooks fire after a restore until the host re-registers per-id
//! hooks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use accord_actuator::{ActuatorData, Toid, Ttid};

use crate::model::Order;

/// Everything the transaction manager needs to resume, minus host closures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmData {
    pub auto_clear_timeout: Duration,
    /// Next order id to allocate.
    pub index: Toid,
    /// Ids below this have been garbage collected.
    pub first_index: Toid,
    pub orders: Vec<(Toid, Order)>,
    pub alive_orders: Vec<Toid>,
    pub task_events: Vec<(Toid, Vec<Ttid>)>,
    pub actuator: ActuatorData,
}
