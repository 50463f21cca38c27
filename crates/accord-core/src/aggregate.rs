//! Phase aggregation: fold a phase's per-task statuses into one verdict.
//!
//! `No` dominates `Doing` dominates `Yes`, so evaluation order never
//! affects the outcome. An empty phase aggregates to `Yes`: a phase with
//! no work is vacuously successful, which is what lets an order with no
//! compensations abort as soon as the compensate phase opens.

use accord_actuator::TaskStatus;

use crate::model::{Order, Phase, PhaseResult};

/// Aggregate an iterator of task statuses into a phase verdict.
pub fn phase_result(statuses: impl IntoIterator<Item = TaskStatus>) -> PhaseResult {
    let mut doing = false;
    for status in statuses {
        match status {
            TaskStatus::Error | TaskStatus::Unknown => return PhaseResult::No,
            TaskStatus::Todo | TaskStatus::Doing => doing = true,
            TaskStatus::Done => {}
        }
    }
    if doing {
        PhaseResult::Doing
    } else {
        PhaseResult::Yes
    }
}

/// Aggregate one phase of an order.
pub fn order_phase(order: &Order, phase: Phase) -> PhaseResult {
    match phase {
        Phase::Prepare => phase_result(order.participants.iter().map(|p| p.status)),
        Phase::Commit => phase_result(order.commits.iter().map(|c| c.status)),
        Phase::Compensate => phase_result(order.compensations.iter().map(|c| c.status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn empty_phase_is_vacuously_yes() {
        assert_eq!(phase_result([]), PhaseResult::Yes);
    }

    #[test]
    fn all_done_is_yes() {
        assert_eq!(phase_result([Done, Done, Done]), PhaseResult::Yes);
    }

    #[test]
    fn any_pending_is_doing() {
        assert_eq!(phase_result([Done, Todo]), PhaseResult::Doing);
        assert_eq!(phase_result([Doing, Done]), PhaseResult::Doing);
    }

    #[test]
    fn failure_dominates_everything() {
        assert_eq!(phase_result([Done, Error, Todo]), PhaseResult::No);
        assert_eq!(phase_result([Unknown]), PhaseResult::No);
        // Order of evaluation must not matter.
        assert_eq!(phase_result([Error, Done, Todo]), PhaseResult::No);
        assert_eq!(phase_result([Todo, Done, Error]), PhaseResult::No);
    }

    #[test]
    fn order_phase_selects_the_right_list() {
        use accord_actuator::Task;
        use serde_json::Value;

        let mut order = Order::new(None);
        order.participants.push(crate::model::Participant {
            ttid: 1,
            prepare: Task::new("a", "prepare", Value::Null),
            commit: Task::new("a", "commit", Value::Null),
            comp: None,
            status: Done,
        });
        order.commits.push(crate::model::CommitTask {
            ttid: 2,
            task: Task::new("a", "commit", Value::Null),
            prepare_ttid: 1,
            status: Todo,
        });

        assert_eq!(order_phase(&order, Phase::Prepare), PhaseResult::Yes);
        assert_eq!(order_phase(&order, Phase::Commit), PhaseResult::Doing);
        assert_eq!(order_phase(&order, Phase::Compensate), PhaseResult::Yes);
    }
}
