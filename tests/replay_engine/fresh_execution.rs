//! Fresh Execution Tests
//!
//! Tests where the orchestration starts from OrchestrationStarted with no prior schedule events.

use super::helpers::*;
use durable_core::{Action, EventKind};
use std::time::Duration;

/// Handler returns Ok immediately - the pass appends the completion.
#[test]
fn immediate_return_ok() {
    let mut engine = create_engine(vec![started_event(1)]);
    let result = execute(&mut engine, ImmediateHandler::ok("success"));

    assert_completed(&result, "success");
    assert!(engine.pending_actions().is_empty(), "No pending actions expected");
    assert_eq!(delta_kinds(&engine), vec!["OrchestrationCompleted"]);
    assert_eq!(engine.history_delta()[0].event_id, 2);
}

/// Handler returns Err immediately - orchestration fails with an application failure.
#[test]
fn immediate_return_err() {
    let mut engine = create_engine(vec![started_event(1)]);
    let result = execute(&mut engine, ImmediateHandler::err("failure"));

    let details = assert_failed(&result);
    assert!(details.is_retryable(), "user failures are application failures");
    assert_eq!(details.message, "failure");
    assert_eq!(delta_kinds(&engine), vec!["OrchestrationFailed"]);
}

/// Handler schedules an activity and awaits - Continue with one pending action.
#[test]
fn schedule_activity_pending() {
    let mut engine = create_engine(vec![started_event(1)]);
    let result = execute(&mut engine, SingleActivityHandler::new("Greet", "Alice"));

    assert_continue(&result);
    assert_eq!(engine.pending_actions().len(), 1, "One pending action expected");
    assert!(has_activity_action(&engine, "Greet"), "Activity action expected");
    assert_eq!(delta_kinds(&engine), vec!["ActivityScheduled"]);
    match &engine.pending_actions()[0] {
        Action::CallActivity { scheduling_event_id, .. } => assert_eq!(*scheduling_event_id, 2),
        other => panic!("unexpected action {other:?}"),
    }
}

#[test]
fn schedule_timer_pending() {
    let mut engine = create_engine(vec![started_event(1)]);
    let result = execute(&mut engine, SingleTimerHandler::new(Duration::from_secs(60)));

    assert_continue(&result);
    assert!(has_timer_action(&engine), "Timer action expected");
    assert_eq!(delta_kinds(&engine), vec!["TimerCreated"]);
}

/// A timer never fires earlier than the logical clock plus its delay, even
/// when history timestamps run ahead of the wall clock.
#[test]
fn timer_fire_time_respects_logical_clock() {
    let mut start = started_event(1);
    start.timestamp_ms += 600_000;
    let started_at = start.timestamp_ms;
    let mut engine = create_engine(vec![start]);
    execute(&mut engine, SingleTimerHandler::new(Duration::from_secs(60)));

    match &engine.history_delta()[0].kind {
        EventKind::TimerCreated { fire_at_ms } => assert_eq!(*fire_at_ms, started_at + 60_000),
        other => panic!("unexpected event {other:?}"),
    }
}

/// Start and first pass in one go, as the dispatcher does for a new instance.
#[test]
fn start_then_execute_on_empty_history() {
    let mut engine = create_engine(Vec::new());
    engine.start(start_request());
    let result = execute(&mut engine, SingleActivityHandler::new("Greet", "Alice"));

    assert_continue(&result);
    assert_eq!(delta_kinds(&engine), vec!["OrchestrationStarted", "ActivityScheduled"]);
    let ids: Vec<u64> = engine.history_delta().iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![1, 2]);
}

/// Everything scheduled before the first unresolved await is recorded in the same pass.
#[test]
fn operations_are_scheduled_eagerly() {
    let mut engine = create_engine(vec![started_event(1)]);
    let h = handler(|ctx, _input| async move {
        let a = ctx.schedule_activity("A", "1");
        let b = ctx.schedule_activity("B", "2");
        let ra = a.into_activity().await?;
        let rb = b.into_activity().await?;
        Ok(format!("{ra}{rb}"))
    });
    let result = execute(&mut engine, h);

    assert_continue(&result);
    assert_eq!(delta_kinds(&engine), vec!["ActivityScheduled", "ActivityScheduled"]);
    assert!(has_activity_action(&engine, "A"));
    assert!(has_activity_action(&engine, "B"));
}

#[test]
fn fresh_code_is_not_replaying() {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let h = handler(move |ctx, _input| {
        let seen = seen_in.clone();
        async move {
            seen.lock().unwrap().push(ctx.is_replaying());
            Ok("done".to_string())
        }
    });
    let mut engine = create_engine(vec![started_event(1)]);
    execute(&mut engine, h);
    assert_eq!(*seen.lock().unwrap(), vec![false]);
}
