//! In-memory order store: id allocation, the alive list, the per-order
//! task-event log, retention-based garbage collection, and pagination.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use accord_actuator::{Toid, Ttid};

use crate::model::Order;

/// Default retention for finished orders before [`OrderStore::clear`]
/// sweeps them: three months.
pub const DEFAULT_AUTO_CLEAR_TIMEOUT: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// One page of orders, 1-indexed over the live id range.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPage {
    pub data: Vec<(Toid, Order)>,
    pub total_page: usize,
    pub total: usize,
}

/// The order map plus its allocation and retention bookkeeping.
#[derive(Debug, Clone)]
pub struct OrderStore {
    orders: BTreeMap<Toid, Order>,
    /// Next order id to allocate. Starts at 1.
    index: Toid,
    /// Ids below this have been garbage collected.
    first_index: Toid,
    /// Orders with at least one participant and a non-terminal status,
    /// in registration order.
    alive: Vec<Toid>,
    /// Per-order log of task completions, in delivery order.
    task_events: BTreeMap<Toid, Vec<Ttid>>,
    auto_clear_timeout: Duration,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: BTreeMap::new(),
            index: 1,
            first_index: 1,
            alive: Vec::new(),
            task_events: BTreeMap::new(),
            auto_clear_timeout: DEFAULT_AUTO_CLEAR_TIMEOUT,
        }
    }

    /// Rebuild a store from snapshotted parts.
    pub fn from_parts(
        auto_clear_timeout: Duration,
        index: Toid,
        first_index: Toid,
        orders: Vec<(Toid, Order)>,
        alive: Vec<Toid>,
        task_events: Vec<(Toid, Vec<Ttid>)>,
    ) -> Self {
        Self {
            orders: orders.into_iter().collect(),
            index,
            first_index,
            alive,
            task_events: task_events.into_iter().collect(),
            auto_clear_timeout,
        }
    }

    /// Allocate the next order id and store a fresh order under it.
    pub fn create(&mut self, data: Option<Value>) -> Toid {
        let toid = self.index;
        self.index += 1;
        self.orders.insert(toid, Order::new(data));
        toid
    }

    pub fn get(&self, toid: Toid) -> Option<&Order> {
        self.orders.get(&toid)
    }

    pub fn get_mut(&mut self, toid: Toid) -> Option<&mut Order> {
        self.orders.get_mut(&toid)
    }

    /// Number of retained orders.
    pub fn count(&self) -> usize {
        self.orders.len()
    }

    /// Next id to be allocated.
    pub fn index(&self) -> Toid {
        self.index
    }

    /// Smallest id that has not been garbage collected.
    pub fn first_index(&self) -> Toid {
        self.first_index
    }

    /// Iterate all retained orders in id order.
    pub fn orders(&self) -> impl Iterator<Item = (Toid, &Order)> {
        self.orders.iter().map(|(toid, order)| (*toid, order))
    }

    /// The alive list: non-terminal orders with at least one participant.
    pub fn alive(&self) -> &[Toid] {
        &self.alive
    }

    /// Register an order as alive (idempotent).
    pub fn mark_alive(&mut self, toid: Toid) {
        if !self.alive.contains(&toid) {
            self.alive.push(toid);
        }
    }

    /// Drop an order from the alive list.
    pub fn retire(&mut self, toid: Toid) {
        self.alive.retain(|t| *t != toid);
    }

    /// Append a completion to an order's task-event log.
    pub fn log_task_event(&mut self, toid: Toid, ttid: Ttid) {
        self.task_events.entry(toid).or_default().push(ttid);
    }

    /// An order's task-event log, in delivery order.
    pub fn task_event_log(&self, toid: Toid) -> &[Ttid] {
        self.task_events.get(&toid).map_or(&[], |log| log.as_slice())
    }

    /// Iterate all task-event logs.
    pub fn task_events(&self) -> impl Iterator<Item = (Toid, &Vec<Ttid>)> {
        self.task_events.iter().map(|(toid, log)| (*toid, log))
    }

    pub fn auto_clear_timeout(&self) -> Duration {
        self.auto_clear_timeout
    }

    pub fn set_auto_clear_timeout(&mut self, timeout: Duration) {
        self.auto_clear_timeout = timeout;
    }

    /// Sweep orders from `first_index` upward.
    ///
    /// An empty slot advances the pointer. An occupied slot is deleted when
    /// its retention has expired and either `del_exc` is set or the order
    /// is terminal; the sweep stops at the first slot it must retain, so
    /// the pointer never passes a live order.
    pub fn clear(&mut self, del_exc: bool) {
        let now = Utc::now();
        while self.first_index < self.index {
            let deletable = match self.orders.get(&self.first_index) {
                None => {
                    self.first_index += 1;
                    continue;
                }
                Some(order) => {
                    let expired = now > retention_deadline(order.time, self.auto_clear_timeout);
                    expired && (del_exc || order.status.is_final())
                }
            };
            if !deletable {
                break;
            }
            self.orders.remove(&self.first_index);
            self.task_events.remove(&self.first_index);
            self.retire(self.first_index);
            self.first_index += 1;
        }
        tracing::debug!(first_index = self.first_index, "order sweep finished");
    }

    /// A 1-indexed page of `size` slots over the live range
    /// `[first_index, index)`. Garbage-collected slots in the range count
    /// toward `total` but yield no data.
    pub fn page(&self, page: usize, size: usize) -> OrderPage {
        let total = (self.index - self.first_index) as usize;
        if page == 0 || size == 0 {
            return OrderPage {
                data: Vec::new(),
                total_page: if size == 0 { 0 } else { total.div_ceil(size) },
                total,
            };
        }
        let start = self.first_index + ((page - 1) * size) as Toid;
        let end = (start + size as Toid).min(self.index);
        let data = (start..end)
            .filter_map(|toid| self.orders.get(&toid).map(|order| (toid, order.clone())))
            .collect();
        OrderPage {
            data,
            total_page: total.div_ceil(size),
            total,
        }
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

/// `at + timeout`, saturating at the far end of the calendar.
fn retention_deadline(at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;

    #[test]
    fn create_allocates_monotonic_ids_from_one() {
        let mut store = OrderStore::new();
        assert_eq!(store.create(None), 1);
        assert_eq!(store.create(None), 2);
        assert_eq!(store.create(None), 3);
        assert_eq!(store.index(), 4);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn alive_list_is_idempotent_and_ordered() {
        let mut store = OrderStore::new();
        let a = store.create(None);
        let b = store.create(None);
        store.mark_alive(a);
        store.mark_alive(b);
        store.mark_alive(a);
        assert_eq!(store.alive(), &[a, b]);
        store.retire(a);
        assert_eq!(store.alive(), &[b]);
    }

    #[test]
    fn clear_skips_nothing_before_expiry() {
        let mut store = OrderStore::new();
        let toid = store.create(None);
        store.get_mut(toid).unwrap().status = OrderStatus::Done;
        store.clear(false);
        assert_eq!(store.first_index(), 1);
        assert!(store.get(toid).is_some());
    }

    #[test]
    fn clear_deletes_expired_terminal_orders() {
        let mut store = OrderStore::new();
        let done = store.create(None);
        store.get_mut(done).unwrap().status = OrderStatus::Done;
        store.log_task_event(done, 1);
        store.set_auto_clear_timeout(Duration::ZERO);

        store.clear(false);
        assert_eq!(store.first_index(), 2);
        assert!(store.get(done).is_none());
        assert!(store.task_event_log(done).is_empty());
    }

    #[test]
    fn clear_stops_at_live_order() {
        let mut store = OrderStore::new();
        let live = store.create(None);
        store.get_mut(live).unwrap().status = OrderStatus::Preparing;
        let done = store.create(None);
        store.get_mut(done).unwrap().status = OrderStatus::Done;
        store.set_auto_clear_timeout(Duration::ZERO);

        store.clear(false);
        // The live order blocks the sweep even though a later order is
        // deletable.
        assert_eq!(store.first_index(), 1);
        assert!(store.get(done).is_some());

        // del_exc sweeps past it.
        store.clear(true);
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn pagination_over_live_range() {
        let mut store = OrderStore::new();
        for _ in 0..5 {
            store.create(None);
        }

        let page = store.page(1, 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.total_page, 3);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].0, 1);
        assert_eq!(page.data[1].0, 2);

        let page = store.page(3, 2);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].0, 5);

        let page = store.page(4, 2);
        assert!(page.data.is_empty());
    }

    #[test]
    fn pagination_counts_swept_slots() {
        let mut store = OrderStore::new();
        let first = store.create(None);
        store.create(None);
        store.get_mut(first).unwrap().status = OrderStatus::Done;
        store.set_auto_clear_timeout(Duration::ZERO);
        store.clear(false);

        let page = store.page(1, 10);
        assert_eq!(page.total, 1);
        assert_eq!(page.total_page, 1);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].0, 2);
    }
}
