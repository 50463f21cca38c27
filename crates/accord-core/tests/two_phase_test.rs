//! Integration tests for the two-phase happy path and the compensating
//! branch, driven end to end through the actuator with a scripted caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use accord_core::{
    NewParticipant, OrderHook, OrderStatus, Phase, PhaseResult, TaskHook, TaskStatus,
    TransactionManager,
};
use accord_test_utils::{
    MockCaller, call_task, drive_to_idle, participant, participant_with_comp,
};

fn counting_hook(counter: Arc<AtomicUsize>) -> TaskHook {
    Arc::new(move |_| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

// ---- Tests ----

#[tokio::test]
async fn happy_path_commits_both_participants() {
    let caller = Arc::new(MockCaller::new());
    let mut tm = TransactionManager::new(caller.clone());

    let toid = tm.create(None, None);
    assert_eq!(toid, 1);

    let first = tm.push(toid, participant("inventory")).expect("push");
    let second = tm.push(toid, participant("billing")).expect("push");
    assert_eq!(first, 1);
    assert_eq!(second, 2);
    assert_eq!(tm.get_alive_orders(), &[toid]);

    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    assert_eq!(tm.status(toid), Some(OrderStatus::Done));
    assert!(tm.is_completed(toid));
    assert!(tm.get_alive_orders().is_empty());

    // Both prepares, then both commits, in completion order.
    let events = tm.get_task_events(toid);
    assert!(events.len() >= 4, "expected 4 events, got {}", events.len());
    assert_eq!(events[0].task.call_type, "prepare");
    assert_eq!(events[1].task.call_type, "prepare");
    assert_eq!(events[2].task.call_type, "commit");
    assert_eq!(events[3].task.call_type, "commit");

    assert_eq!(caller.call_count("inventory", "prepare"), 1);
    assert_eq!(caller.call_count("billing", "prepare"), 1);
    assert_eq!(caller.call_count("inventory", "commit"), 1);
    assert_eq!(caller.call_count("billing", "commit"), 1);

    // A finished order holds no outstanding actuator tasks.
    assert_eq!(tm.actuator().pending_for_order(toid), 0);

    let order = tm.get_order(toid).expect("order retained");
    assert!(order.participants.iter().all(|p| p.status == TaskStatus::Done));
    assert!(order.commits.iter().all(|c| c.status == TaskStatus::Done));
    assert_eq!(order.callback_status, Some(TaskStatus::Done));
    assert_eq!(tm.phase(toid, Phase::Prepare), Some(PhaseResult::Yes));
    assert_eq!(tm.phase(toid, Phase::Commit), Some(PhaseResult::Yes));
}

#[tokio::test]
async fn commits_link_back_to_their_prepares() {
    let caller = Arc::new(MockCaller::new());
    let mut tm = TransactionManager::new(caller);

    let toid = tm.create(None, None);
    let first = tm.push(toid, participant("a")).expect("push");
    let second = tm.push(toid, participant("b")).expect("push");
    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    let order = tm.get_order(toid).expect("order retained");
    assert_eq!(order.commits.len(), 2);
    assert_eq!(order.commits[0].prepare_ttid, first);
    assert_eq!(order.commits[1].prepare_ttid, second);
    // Commits are independent: no prerequisite edges.
    assert!(order.commits.iter().all(|c| c.task.pre_ttids.is_empty()));
    // Commit ids come from the same allocator, after the prepares.
    assert!(order.commits.iter().all(|c| c.ttid > second));
}

#[tokio::test]
async fn failed_prepare_triggers_compensation() {
    let caller = Arc::new(MockCaller::new());
    // billing's prepare fails on every attempt of its budget of 2.
    caller.fail_times("billing", "prepare", 2);
    let mut tm = TransactionManager::new(caller.clone());

    let toid = tm.create(None, None);
    let first = tm.push(toid, participant_with_comp("inventory")).expect("push");
    tm.push(toid, participant("billing")).expect("push");
    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    assert_eq!(tm.status(toid), Some(OrderStatus::Aborted));
    assert!(tm.get_alive_orders().is_empty());

    let order = tm.get_order(toid).expect("order retained");
    // Only the participant whose prepare succeeded is compensated.
    assert_eq!(order.compensations.len(), 1);
    assert_eq!(order.compensations[0].for_ttid, first);
    assert_eq!(order.compensations[0].status, TaskStatus::Done);
    // Commits were never fanned out.
    assert!(order.commits.is_empty());
    assert_eq!(caller.call_count("inventory", "commit"), 0);
    assert_eq!(caller.call_count("billing", "commit"), 0);
    assert_eq!(caller.call_count("inventory", "compensate"), 1);
    // The failing prepare consumed its whole retry budget.
    assert_eq!(caller.call_count("billing", "prepare"), 2);
    assert_eq!(tm.phase(toid, Phase::Compensate), Some(PhaseResult::Yes));
}

#[tokio::test]
async fn failed_prepare_without_compensations_aborts_immediately() {
    let caller = Arc::new(MockCaller::new());
    caller.fail_times("billing", "prepare", 2);
    let mut tm = TransactionManager::new(caller);

    let toid = tm.create(None, None);
    // Neither participant carries a compensation.
    tm.push(toid, participant("inventory")).expect("push");
    tm.push(toid, participant("billing")).expect("push");
    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    // The compensate phase had no work, which is vacuously successful.
    assert_eq!(tm.status(toid), Some(OrderStatus::Aborted));
    let order = tm.get_order(toid).expect("order retained");
    assert!(order.compensations.is_empty());
}

#[tokio::test]
async fn indeterminate_prepare_rejects_the_phase() {
    let caller = Arc::new(MockCaller::new());
    caller.lose_reply("billing", "prepare");
    let mut tm = TransactionManager::new(caller.clone());

    let toid = tm.create(None, None);
    tm.push(toid, participant_with_comp("inventory")).expect("push");
    tm.push(toid, participant("billing")).expect("push");
    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    // An unknown outcome is not retried and counts as a rejection.
    assert_eq!(caller.call_count("billing", "prepare"), 1);
    assert_eq!(tm.status(toid), Some(OrderStatus::Aborted));
}

#[tokio::test]
async fn removed_participant_is_not_considered() {
    let caller = Arc::new(MockCaller::new());
    let mut tm = TransactionManager::new(caller.clone());

    let toid = tm.create(None, None);
    let first = tm.push(toid, participant("a")).expect("push");
    let second = tm.push(toid, participant("b")).expect("push");
    let third = tm.push(toid, participant("c")).expect("push");

    assert_eq!(tm.remove(toid, second).expect("remove"), Some(second));

    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    assert_eq!(tm.status(toid), Some(OrderStatus::Done));
    let order = tm.get_order(toid).expect("order retained");
    let ttids: Vec<_> = order.participants.iter().map(|p| p.ttid).collect();
    assert_eq!(ttids, vec![first, third]);
    assert_eq!(order.commits.len(), 2);
    // The removed participant never reached its callee.
    assert_eq!(caller.call_count("b", "prepare"), 0);
    assert_eq!(caller.call_count("b", "commit"), 0);
}

#[tokio::test]
async fn per_participant_hooks_fire_on_completion() {
    let caller = Arc::new(MockCaller::new());
    let mut tm = TransactionManager::new(caller);

    let prepare_hits = Arc::new(AtomicUsize::new(0));
    let commit_hits = Arc::new(AtomicUsize::new(0));
    let order_hits = Arc::new(AtomicUsize::new(0));

    let order_hook: OrderHook = {
        let order_hits = Arc::clone(&order_hits);
        Arc::new(move |_toid, status, _data| {
            let order_hits = Arc::clone(&order_hits);
            Box::pin(async move {
                assert_eq!(status, OrderStatus::Done);
                order_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    };

    let toid = tm.create(None, Some(order_hook));
    let hooked = NewParticipant::new(call_task("a", "prepare"), call_task("a", "commit"))
        .with_on_prepare(counting_hook(Arc::clone(&prepare_hits)))
        .with_on_commit(counting_hook(Arc::clone(&commit_hits)));
    tm.push(toid, hooked).expect("push");
    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    assert_eq!(tm.status(toid), Some(OrderStatus::Done));
    assert_eq!(prepare_hits.load(Ordering::SeqCst), 1);
    assert_eq!(commit_hits.load(Ordering::SeqCst), 1);
    assert_eq!(order_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_order_hook_is_recorded_not_raised() {
    let caller = Arc::new(MockCaller::new());
    let mut tm = TransactionManager::new(caller);

    let order_hook: OrderHook =
        Arc::new(|_toid, _status, _data| Box::pin(async { anyhow::bail!("host-side bug") }));

    let toid = tm.create(None, Some(order_hook));
    tm.push(toid, participant("a")).expect("push");
    tm.finish(toid).expect("finish");
    drive_to_idle(&mut tm, toid).await.expect("drive");

    // The order still terminalized; only the callback outcome records the
    // failure.
    assert_eq!(tm.status(toid), Some(OrderStatus::Done));
    let order = tm.get_order(toid).expect("order retained");
    assert_eq!(order.callback_status, Some(TaskStatus::Error));
}

#[tokio::test]
async fn concurrent_orders_do_not_interfere() {
    let caller = Arc::new(MockCaller::new());
    caller.fail_times("flaky", "prepare", 2);
    let mut tm = TransactionManager::new(caller);

    let good = tm.create(None, None);
    tm.push(good, participant("steady")).expect("push");
    tm.finish(good).expect("finish");

    let bad = tm.create(None, None);
    tm.push(bad, participant_with_comp("steady")).expect("push");
    tm.push(bad, participant("flaky")).expect("push");
    tm.finish(bad).expect("finish");

    drive_to_idle(&mut tm, good).await.expect("drive");
    drive_to_idle(&mut tm, bad).await.expect("drive");

    assert_eq!(tm.status(good), Some(OrderStatus::Done));
    assert_eq!(tm.status(bad), Some(OrderStatus::Aborted));
    assert!(tm.get_alive_orders().is_empty());
    assert_eq!(tm.count(), 2);
}
