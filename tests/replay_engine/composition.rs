//! Composition Tests
//!
//! select2 / first_of / join / all_of over replayed and delivered results.

use super::helpers::*;
use durable_core::runtime::replay_engine::TurnResult;
use durable_core::{DurableOutput, Either2};
use std::time::Duration;

fn activity_vs_timer() -> std::sync::Arc<dyn durable_core::runtime::OrchestrationHandler> {
    handler(|ctx, _input| async move {
        let activity = ctx.schedule_activity("Slow", "x");
        let timer = ctx.schedule_timer(Duration::from_secs(5));
        match ctx.select2(activity, timer).await {
            Either2::First(out) => Ok(format!("activity:{}", out.into_activity_result()?)),
            Either2::Second(_) => Ok("timeout".to_string()),
        }
    })
}

#[test]
fn select2_schedules_both_members() {
    let mut engine = create_engine(vec![started_event(1)]);
    assert_continue(&execute(&mut engine, activity_vs_timer()));
    assert!(has_activity_action(&engine, "Slow"));
    assert!(has_timer_action(&engine));
}

/// The member whose completion is earlier in history wins.
#[test]
fn select2_winner_is_first_in_history() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "Slow", "x"),
        timer_created(3, 5_000),
        timer_fired(4, 3, 5_000),
        activity_completed(5, 2, "late"),
    ];
    let mut engine = create_engine(history);
    assert_completed(&execute(&mut engine, activity_vs_timer()), "timeout");
}

/// Both completions in one batch: arrival order in the batch decides.
#[test]
fn select2_same_batch_uses_batch_order() {
    let mut engine = create_engine(vec![
        started_event(1),
        activity_scheduled(2, "Slow", "x"),
        timer_created(3, 5_000),
    ]);
    engine.prep_completions(vec![activity_completed_msg(2, "fast"), timer_fired_msg(3, 5_000)]);

    assert_completed(&execute(&mut engine, activity_vs_timer()), "activity:fast");
}

/// The loser's late completion is recorded; the winner's result does not change.
#[test]
fn loser_completion_does_not_change_winner() {
    let history = vec![
        started_event(1),
        activity_scheduled(2, "Slow", "x"),
        timer_created(3, 5_000),
        timer_fired(4, 3, 5_000),
    ];
    let h = handler(|ctx, _input| async move {
        let activity = ctx.schedule_activity("Slow", "x");
        let timer = ctx.schedule_timer(Duration::from_secs(5));
        let first = match ctx.select2(activity, timer).await {
            Either2::First(_) => "activity",
            Either2::Second(_) => "timeout",
        };
        let next = ctx.schedule_activity("Next", first).into_activity().await?;
        Ok(next)
    });
    let mut engine = create_engine(history);
    assert_continue(&execute(&mut engine, h.clone()));
    assert!(has_activity_action(&engine, "Next"));

    // Next pass: the loser reports in after the race was decided.
    let mut history = engine.final_history();
    let next_id = history.last().unwrap().event_id + 1;
    history.push(activity_completed(next_id, 2, "late"));
    let mut engine = create_engine(history);
    assert_continue(&execute(&mut engine, h));
    assert!(engine.pending_actions().is_empty());
}

#[test]
fn first_of_returns_index_and_losers() {
    let history = vec![
        started_event(1),
        external_subscribed(2, "A"),
        external_subscribed(3, "B"),
        external_subscribed(4, "C"),
        external_event(5, "B", "b!"),
    ];
    let h = handler(|ctx, _input| async move {
        let members = vec![ctx.schedule_wait("A"), ctx.schedule_wait("B"), ctx.schedule_wait("C")];
        let (index, output, losers) = ctx.first_of(members).await;
        match output {
            DurableOutput::External(data) => Ok(format!("{index}:{data}:{}", losers.len())),
            other => Ok(format!("unexpected {other:?}")),
        }
    });
    let mut engine = create_engine(history);
    assert_completed(&execute(&mut engine, h), "1:b!:2");
}

#[test]
fn join_waits_for_all_in_argument_order() {
    let h = handler(|ctx, _input| async move {
        let outs = ctx
            .join(vec![ctx.schedule_activity("A", "1"), ctx.schedule_activity("B", "2")])
            .await;
        let results: Result<Vec<String>, _> = outs.into_iter().map(DurableOutput::into_activity_result).collect();
        Ok(results?.join(","))
    });

    let mut engine = create_engine(vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_scheduled(3, "B", "2"),
        activity_completed(4, 3, "b"),
    ]);
    assert_continue(&execute(&mut engine, h.clone()));

    let mut engine = create_engine(vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_scheduled(3, "B", "2"),
        activity_completed(4, 3, "b"),
        activity_completed(5, 2, "a"),
    ]);
    assert_completed(&execute(&mut engine, h), "a,b");
}

fn all_of_handler() -> std::sync::Arc<dyn durable_core::runtime::OrchestrationHandler> {
    handler(|ctx, _input| async move {
        let outs = ctx
            .all_of(vec![ctx.schedule_activity("A", "1"), ctx.schedule_activity("B", "2")])
            .await?;
        Ok(format!("{} results", outs.len()))
    })
}

/// A failure does not resolve all_of while another member is outstanding.
#[test]
fn all_of_waits_for_every_member_after_failure() {
    let mut engine = create_engine(vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_scheduled(3, "B", "2"),
        activity_failed(4, 2, "boom"),
    ]);

    assert_eq!(execute(&mut engine, all_of_handler()), TurnResult::Continue);
    assert!(engine.history_delta().is_empty());
}

#[test]
fn all_of_fails_once_every_member_resolved() {
    let mut engine = create_engine(vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_scheduled(3, "B", "2"),
        activity_failed(4, 3, "b broke"),
        activity_completed(5, 2, "a"),
    ]);

    let details = assert_failed(&execute(&mut engine, all_of_handler()));
    assert_eq!(details.message, "b broke");
    assert!(details.inner_failure.is_none());
}

/// Every failure is reported; the earliest in history comes first.
#[test]
fn all_of_chains_later_failures_as_causes() {
    let mut engine = create_engine(vec![
        started_event(1),
        activity_scheduled(2, "A", "1"),
        activity_scheduled(3, "B", "2"),
        activity_failed(4, 3, "b broke"),
        activity_failed(5, 2, "a broke"),
    ]);

    let details = assert_failed(&execute(&mut engine, all_of_handler()));
    assert_eq!(details.message, "b broke");
    assert_eq!(details.inner_failure.as_deref().map(|f| f.message.as_str()), Some("a broke"));
}
