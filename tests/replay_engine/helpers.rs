//! Test helpers for replay engine tests
//!
//! Provides utilities for constructing test histories, mock handlers,
//! and asserting on TurnResult outcomes.

use async_trait::async_trait;
use durable_core::providers::WorkItem;
use durable_core::runtime::replay_engine::{ReplayEngine, StartRequest, TurnResult};
use durable_core::runtime::{FnOrchestration, OrchestrationHandler};
use durable_core::{Action, Event, EventKind, FailureDetail, OrchestrationContext};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Test Constants
// ============================================================================

pub const TEST_INSTANCE: &str = "test-instance";
pub const TEST_EXECUTION_ID: u64 = 1;
pub const TEST_ORCH_NAME: &str = "TestOrch";
pub const TEST_ORCH_VERSION: &str = "1.0.0";

// ============================================================================
// Event Builders
// ============================================================================

fn event(event_id: u64, source: Option<u64>, kind: EventKind) -> Event {
    Event::with_event_id(event_id, TEST_INSTANCE, TEST_EXECUTION_ID, source, kind)
}

/// Create an OrchestrationStarted event
pub fn started_event(event_id: u64) -> Event {
    event(
        event_id,
        None,
        EventKind::OrchestrationStarted {
            name: TEST_ORCH_NAME.to_string(),
            version: TEST_ORCH_VERSION.to_string(),
            input: "test-input".to_string(),
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
            scheduled_start_ms: None,
            tags: BTreeMap::new(),
        },
    )
}

pub fn start_request() -> StartRequest {
    StartRequest {
        name: TEST_ORCH_NAME.to_string(),
        version: TEST_ORCH_VERSION.to_string(),
        input: "test-input".to_string(),
        parent_instance: None,
        parent_id: None,
        parent_execution_id: None,
        scheduled_start_ms: None,
        tags: BTreeMap::new(),
    }
}

pub fn activity_scheduled(event_id: u64, name: &str, input: &str) -> Event {
    event(
        event_id,
        None,
        EventKind::ActivityScheduled {
            name: name.to_string(),
            input: input.to_string(),
        },
    )
}

pub fn activity_completed(event_id: u64, source_id: u64, result: &str) -> Event {
    event(
        event_id,
        Some(source_id),
        EventKind::ActivityCompleted {
            result: result.to_string(),
        },
    )
}

pub fn activity_failed(event_id: u64, source_id: u64, message: &str) -> Event {
    event(
        event_id,
        Some(source_id),
        EventKind::ActivityFailed {
            details: FailureDetail::new("ActivityError", message),
        },
    )
}

pub fn timer_created(event_id: u64, fire_at_ms: u64) -> Event {
    event(event_id, None, EventKind::TimerCreated { fire_at_ms })
}

pub fn timer_fired(event_id: u64, source_id: u64, fire_at_ms: u64) -> Event {
    event(event_id, Some(source_id), EventKind::TimerFired { fire_at_ms })
}

pub fn external_subscribed(event_id: u64, name: &str) -> Event {
    event(event_id, None, EventKind::ExternalSubscribed { name: name.to_string() })
}

pub fn external_event(event_id: u64, name: &str, data: &str) -> Event {
    event(
        event_id,
        None,
        EventKind::ExternalEvent {
            name: name.to_string(),
            data: data.to_string(),
        },
    )
}

pub fn sub_orch_scheduled(event_id: u64, name: &str, input: &str) -> Event {
    event(
        event_id,
        None,
        EventKind::SubOrchestrationScheduled {
            name: name.to_string(),
            instance: format!("{TEST_INSTANCE}::sub::{event_id}"),
            input: input.to_string(),
        },
    )
}

pub fn sub_orch_completed(event_id: u64, source_id: u64, result: &str) -> Event {
    event(
        event_id,
        Some(source_id),
        EventKind::SubOrchestrationCompleted {
            result: result.to_string(),
        },
    )
}

pub fn suspended_event(event_id: u64) -> Event {
    event(
        event_id,
        None,
        EventKind::OrchestrationSuspended {
            reason: "paused".to_string(),
        },
    )
}

pub fn orchestration_completed(event_id: u64, output: &str) -> Event {
    event(
        event_id,
        None,
        EventKind::OrchestrationCompleted {
            output: output.to_string(),
        },
    )
}

// ============================================================================
// WorkItem Builders (Completion Messages)
// ============================================================================

pub fn activity_completed_msg(id: u64, result: &str) -> WorkItem {
    WorkItem::ActivityCompleted {
        instance: TEST_INSTANCE.to_string(),
        execution_id: TEST_EXECUTION_ID,
        id,
        result: result.to_string(),
    }
}

pub fn activity_failed_msg(id: u64, message: &str) -> WorkItem {
    WorkItem::ActivityFailed {
        instance: TEST_INSTANCE.to_string(),
        execution_id: TEST_EXECUTION_ID,
        id,
        details: FailureDetail::new("ActivityError", message),
    }
}

pub fn activity_failed_infra_msg(id: u64, message: &str) -> WorkItem {
    WorkItem::ActivityFailed {
        instance: TEST_INSTANCE.to_string(),
        execution_id: TEST_EXECUTION_ID,
        id,
        details: FailureDetail::infrastructure("test", message),
    }
}

pub fn timer_fired_msg(id: u64, fire_at_ms: u64) -> WorkItem {
    WorkItem::TimerFired {
        instance: TEST_INSTANCE.to_string(),
        execution_id: TEST_EXECUTION_ID,
        id,
        fire_at_ms,
    }
}

pub fn external_raised_msg(name: &str, data: &str) -> WorkItem {
    WorkItem::ExternalRaised {
        instance: TEST_INSTANCE.to_string(),
        name: name.to_string(),
        data: data.to_string(),
    }
}

pub fn sub_orch_completed_msg(parent_id: u64, result: &str) -> WorkItem {
    WorkItem::SubOrchCompleted {
        parent_instance: TEST_INSTANCE.to_string(),
        parent_execution_id: TEST_EXECUTION_ID,
        parent_id,
        result: result.to_string(),
    }
}

pub fn sub_orch_failed_msg(parent_id: u64, message: &str) -> WorkItem {
    WorkItem::SubOrchFailed {
        parent_instance: TEST_INSTANCE.to_string(),
        parent_execution_id: TEST_EXECUTION_ID,
        parent_id,
        details: FailureDetail::new("ChildError", message),
    }
}

pub fn suspend_msg(reason: &str) -> WorkItem {
    WorkItem::SuspendInstance {
        instance: TEST_INSTANCE.to_string(),
        reason: reason.to_string(),
    }
}

pub fn resume_msg(reason: &str) -> WorkItem {
    WorkItem::ResumeInstance {
        instance: TEST_INSTANCE.to_string(),
        reason: reason.to_string(),
    }
}

pub fn terminate_msg(reason: &str) -> WorkItem {
    WorkItem::TerminateInstance {
        instance: TEST_INSTANCE.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// Mock Handlers
// ============================================================================

/// Wrap an async closure as a handler.
pub fn handler<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, FailureDetail>> + Send + 'static,
{
    Arc::new(FnOrchestration(f))
}

/// A mock handler that returns a fixed result
pub struct ImmediateHandler {
    result: Result<String, FailureDetail>,
}

impl ImmediateHandler {
    pub fn ok(result: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(result.to_string()),
        })
    }

    pub fn err(error: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(FailureDetail::from(error)),
        })
    }
}

#[async_trait]
impl OrchestrationHandler for ImmediateHandler {
    async fn invoke(&self, _ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        self.result.clone()
    }
}

/// A mock handler that schedules one activity and awaits it
pub struct SingleActivityHandler {
    activity_name: String,
    activity_input: String,
}

impl SingleActivityHandler {
    pub fn new(name: &str, input: &str) -> Arc<Self> {
        Arc::new(Self {
            activity_name: name.to_string(),
            activity_input: input.to_string(),
        })
    }
}

#[async_trait]
impl OrchestrationHandler for SingleActivityHandler {
    async fn invoke(&self, ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        ctx.schedule_activity(self.activity_name.clone(), self.activity_input.clone())
            .into_activity()
            .await
    }
}

/// A mock handler that schedules a timer and awaits it
pub struct SingleTimerHandler {
    duration: Duration,
}

impl SingleTimerHandler {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self { duration })
    }
}

#[async_trait]
impl OrchestrationHandler for SingleTimerHandler {
    async fn invoke(&self, ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        ctx.schedule_timer(self.duration).into_timer().await;
        Ok("timer_done".to_string())
    }
}

/// A mock handler that waits for an external event
pub struct WaitExternalHandler {
    event_name: String,
}

impl WaitExternalHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            event_name: name.to_string(),
        })
    }
}

#[async_trait]
impl OrchestrationHandler for WaitExternalHandler {
    async fn invoke(&self, ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        Ok(ctx.schedule_wait(self.event_name.clone()).into_event().await)
    }
}

/// A mock handler that schedules two activities sequentially
pub struct TwoActivitiesHandler {
    first: (String, String),
    second: (String, String),
}

impl TwoActivitiesHandler {
    pub fn new(first: (&str, &str), second: (&str, &str)) -> Arc<Self> {
        Arc::new(Self {
            first: (first.0.to_string(), first.1.to_string()),
            second: (second.0.to_string(), second.1.to_string()),
        })
    }
}

#[async_trait]
impl OrchestrationHandler for TwoActivitiesHandler {
    async fn invoke(&self, ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        let r1 = ctx
            .schedule_activity(self.first.0.clone(), self.first.1.clone())
            .into_activity()
            .await?;
        let r2 = ctx
            .schedule_activity(self.second.0.clone(), self.second.1.clone())
            .into_activity()
            .await?;
        Ok(format!("{r1},{r2}"))
    }
}

/// A mock handler that panics
pub struct PanicHandler {
    message: String,
}

impl PanicHandler {
    pub fn new(msg: &str) -> Arc<Self> {
        Arc::new(Self {
            message: msg.to_string(),
        })
    }
}

#[async_trait]
impl OrchestrationHandler for PanicHandler {
    async fn invoke(&self, _ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        panic!("{}", self.message);
    }
}

/// A mock handler that counts invocations
pub struct CountingHandler {
    count: AtomicUsize,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrchestrationHandler for CountingHandler {
    async fn invoke(&self, _ctx: OrchestrationContext, _input: String) -> Result<String, FailureDetail> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok("counted".to_string())
    }
}

// ============================================================================
// Engine Execution Helpers
// ============================================================================

/// Create an engine with the given baseline history
pub fn create_engine(history: Vec<Event>) -> ReplayEngine {
    ReplayEngine::new(TEST_INSTANCE.to_string(), TEST_EXECUTION_ID, history)
}

/// Execute an orchestration pass with the given handler
pub fn execute(engine: &mut ReplayEngine, handler: Arc<dyn OrchestrationHandler>) -> TurnResult {
    engine.execute_orchestration(handler, "test-input".to_string())
}

// ============================================================================
// Assertions
// ============================================================================

pub fn assert_continue(result: &TurnResult) {
    assert!(
        matches!(result, TurnResult::Continue),
        "Expected TurnResult::Continue, got {result:?}"
    );
}

pub fn assert_completed(result: &TurnResult, expected: &str) {
    match result {
        TurnResult::Completed(output) => {
            assert_eq!(output, expected, "Unexpected completion output");
        }
        _ => panic!("Expected TurnResult::Completed, got {result:?}"),
    }
}

pub fn assert_failed(result: &TurnResult) -> FailureDetail {
    match result {
        TurnResult::Failed(details) => details.clone(),
        _ => panic!("Expected TurnResult::Failed, got {result:?}"),
    }
}

pub fn assert_nondeterminism(result: &TurnResult) {
    match result {
        TurnResult::Failed(details) if details.is_nondeterminism() => {}
        _ => panic!("Expected TurnResult::Failed(Nondeterminism), got {result:?}"),
    }
}

pub fn has_activity_action(engine: &ReplayEngine, name: &str) -> bool {
    engine
        .pending_actions()
        .iter()
        .any(|a| matches!(a, Action::CallActivity { name: n, .. } if n == name))
}

pub fn has_timer_action(engine: &ReplayEngine) -> bool {
    engine
        .pending_actions()
        .iter()
        .any(|a| matches!(a, Action::CreateTimer { .. }))
}

/// Kind names of the events this pass appended, in order.
pub fn delta_kinds(engine: &ReplayEngine) -> Vec<&'static str> {
    engine.history_delta().iter().map(Event::kind_name).collect()
}
