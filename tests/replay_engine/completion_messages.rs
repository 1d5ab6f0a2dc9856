//! Completion Message Tests
//!
//! Tests for prep_completions: duplicates, stale incarnations, unknown ids,
//! kind mismatches and system failures.

use super::helpers::*;
use durable_core::FailureCategory;
use durable_core::providers::WorkItem;

/// A completion for an already resolved id is dropped; the first result stands.
#[test]
fn duplicate_completion_is_dropped() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "Task", "x"),
        activity_completed(3, 2, "first"),
    ];
    let mut engine = create_engine(history);
    engine.prep_completions(vec![activity_completed_msg(2, "second")]);
    assert!(engine.history_delta().is_empty());

    let result = execute(&mut engine, SingleActivityHandler::new("Task", "x"));
    assert_completed(&result, "first");
}

#[test]
fn duplicate_in_same_batch_is_dropped() {
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Task", "x")]);
    engine.prep_completions(vec![activity_completed_msg(2, "first"), activity_failed_msg(2, "late")]);

    assert_eq!(delta_kinds(&engine), vec!["ActivityCompleted"]);
    assert_completed(&execute(&mut engine, SingleActivityHandler::new("Task", "x")), "first");
}

/// Completions from an earlier incarnation of the instance never land.
#[test]
fn stale_execution_completion_is_dropped() {
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Task", "x")]);
    engine.prep_completions(vec![WorkItem::ActivityCompleted {
        instance: TEST_INSTANCE.to_string(),
        execution_id: TEST_EXECUTION_ID + 1,
        id: 2,
        result: "stale".to_string(),
    }]);

    assert!(engine.history_delta().is_empty());
    assert_continue(&execute(&mut engine, SingleActivityHandler::new("Task", "x")));
}

#[test]
fn unknown_id_is_ignored() {
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Task", "x")]);
    engine.prep_completions(vec![activity_completed_msg(42, "nobody asked")]);

    assert!(engine.history_delta().is_empty());
    let result = execute(&mut engine, SingleActivityHandler::new("Task", "x"));
    assert_continue(&result);
    assert!(engine.pending_actions().is_empty(), "replayed schedule is not dispatched again");
}

/// A timer firing for an id that was scheduled as an activity is nondeterminism.
#[test]
fn completion_kind_mismatch_fails_instance() {
    let handler = CountingHandler::new();
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Task", "x")]);
    engine.prep_completions(vec![timer_fired_msg(2, 0)]);

    let result = execute(&mut engine, handler.clone());

    assert_nondeterminism(&result);
    let details = assert_failed(&result);
    assert!(details.message.contains("completion kind mismatch for id=2"), "{}", details.message);
    assert_eq!(handler.count(), 0, "no orchestration code runs after a kind mismatch");
}

/// Infrastructure failures of an activity are not the orchestration's to handle.
#[test]
fn infrastructure_failure_aborts_pass() {
    let handler = CountingHandler::new();
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Task", "x")]);
    engine.prep_completions(vec![activity_failed_infra_msg(2, "disk full")]);

    let result = execute(&mut engine, handler.clone());

    let details = assert_failed(&result);
    assert_eq!(details.category, FailureCategory::Infrastructure);
    assert_eq!(handler.count(), 0);
    assert_eq!(delta_kinds(&engine), vec!["ActivityFailed", "OrchestrationFailed"]);
}

/// Application failures are delivered to code like any other result.
#[test]
fn application_failure_reaches_code() {
    let mut engine = create_engine(vec![started_event(1), activity_scheduled(2, "Task", "x")]);
    engine.prep_completions(vec![activity_failed_msg(2, "boom")]);

    let details = assert_failed(&execute(&mut engine, SingleActivityHandler::new("Task", "x")));
    assert_eq!(details.category, FailureCategory::Application);
    assert_eq!(details.message, "boom");
}

/// Late deliveries to a finished instance are recorded but run no code.
#[test]
fn completion_after_terminal_is_recorded_only() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_scheduled(3, "B", "2"),
        activity_completed(4, 2, "a"),
        orchestration_completed(5, "a"),
    ];
    let handler = CountingHandler::new();
    let mut engine = create_engine(history);
    engine.prep_completions(vec![activity_completed_msg(3, "b")]);

    let result = execute(&mut engine, handler.clone());

    assert_eq!(result, durable_core::runtime::replay_engine::TurnResult::AlreadyTerminal);
    assert_eq!(delta_kinds(&engine), vec!["ActivityCompleted"]);
    assert_eq!(handler.count(), 0);
}
