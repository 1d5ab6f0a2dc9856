//! Replay With Completions Tests
//!
//! Tests where history already holds scheduling events and their completions.

use super::helpers::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Activity scheduled and completed in history - replay completes without new work.
#[test]
fn replay_completed_activity() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "Greet", "Alice"),
        activity_completed(3, 2, "Hello, Alice"),
    ];
    let mut engine = create_engine(history);
    let result = execute(&mut engine, SingleActivityHandler::new("Greet", "Alice"));

    assert_completed(&result, "Hello, Alice");
    assert!(engine.pending_actions().is_empty(), "replayed work is not dispatched again");
    assert_eq!(delta_kinds(&engine), vec!["OrchestrationCompleted"]);
    assert_eq!(engine.history_delta()[0].event_id, 4);
}

/// A completion delivered as a message is recorded and observed in the same pass.
#[test]
fn completion_message_resolves_activity() {
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Greet", "Alice")]);
    engine.prep_completions(vec![activity_completed_msg(2, "hi")]);
    let result = execute(&mut engine, SingleActivityHandler::new("Greet", "Alice"));

    assert_completed(&result, "hi");
    assert_eq!(delta_kinds(&engine), vec!["ActivityCompleted", "OrchestrationCompleted"]);
    assert_eq!(engine.history_delta()[0].source_event_id, Some(2));
    assert_eq!(engine.history_delta()[0].event_id, 3);
}

/// First activity done, second scheduled with the next free event id.
#[test]
fn sequential_progress() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_completed(3, 2, "a"),
    ];
    let mut engine = create_engine(history);
    let result = execute(&mut engine, TwoActivitiesHandler::new(("A", "1"), ("B", "2")));

    assert_continue(&result);
    assert!(has_activity_action(&engine, "B"));
    assert!(!has_activity_action(&engine, "A"));
    assert_eq!(engine.history_delta()[0].event_id, 4);
}

#[test]
fn activity_failure_surfaces_to_code() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "Charge", "42"),
        activity_failed(3, 2, "card declined"),
    ];
    let mut engine = create_engine(history);
    let result = execute(&mut engine, SingleActivityHandler::new("Charge", "42"));

    let details = assert_failed(&result);
    assert!(details.is_caused_by("ActivityError"));
    assert_eq!(details.message, "card declined");
}

/// Orchestration code may handle an activity failure and carry on.
#[test]
fn handled_activity_failure_continues() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "Charge", "42"),
        activity_failed(3, 2, "card declined"),
    ];
    let h = handler(|ctx, _input| async move {
        match ctx.schedule_activity("Charge", "42").into_activity().await {
            Ok(r) => Ok(r),
            Err(e) if e.is_caused_by("ActivityError") => Ok("compensated".to_string()),
            Err(e) => Err(e),
        }
    });
    let mut engine = create_engine(history);
    assert_completed(&execute(&mut engine, h), "compensated");
}

#[test]
fn timer_fired_message_resolves_timer() {
    let mut engine = create_engine(vec![started_event(1), timer_created(2, 1_000)]);
    engine.prep_completions(vec![timer_fired_msg(2, 1_000)]);
    let result = execute(&mut engine, SingleTimerHandler::new(Duration::from_secs(1)));

    assert_completed(&result, "timer_done");
    assert_eq!(delta_kinds(&engine), vec!["TimerFired", "OrchestrationCompleted"]);
}

/// is_replaying is true until the last recorded scheduling event is claimed.
#[test]
fn is_replaying_flips_after_last_recorded_schedule() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_completed(3, 2, "a"),
    ];
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let h = handler(move |ctx, _input| {
        let seen = seen_in.clone();
        async move {
            seen.lock().unwrap().push(ctx.is_replaying());
            let a = ctx.schedule_activity("A", "1").into_activity().await?;
            seen.lock().unwrap().push(ctx.is_replaying());
            Ok(a)
        }
    });
    let mut engine = create_engine(history);
    assert_completed(&execute(&mut engine, h), "a");
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

/// utc_now_ms advances with the timestamps of the events the code has observed.
#[test]
fn logical_clock_follows_observed_events() {
    let mut start = started_event(1);
    start.timestamp_ms = 1_000;
    let mut scheduled = activity_scheduled(2, "A", "1");
    scheduled.timestamp_ms = 1_000;
    let mut completed = activity_completed(3, 2, "a");
    completed.timestamp_ms = 5_000;

    let times = Arc::new(Mutex::new(Vec::new()));
    let times_in = times.clone();
    let h = handler(move |ctx, _input| {
        let times = times_in.clone();
        async move {
            times.lock().unwrap().push(ctx.utc_now_ms());
            ctx.schedule_activity("A", "1").into_activity().await?;
            times.lock().unwrap().push(ctx.utc_now_ms());
            Ok("done".to_string())
        }
    });
    let mut engine = create_engine(vec![start, scheduled, completed]);
    execute(&mut engine, h);
    assert_eq!(*times.lock().unwrap(), vec![1_000, 5_000]);
}
