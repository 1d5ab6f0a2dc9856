//! Deterministic, replay-based durable orchestration core.
//!
//! Orchestration code is ordinary async Rust written against an
//! [`OrchestrationContext`]. Every side effect (activity calls, timers,
//! external event waits, sub-orchestrations) is scheduled through the context,
//! recorded in an append-only history, and replayed on every execution pass so
//! that the code observes exactly the same results after a crash or restart.
//!
//! ```rust,no_run
//! use durable_core::providers::in_memory::InMemoryProvider;
//! use durable_core::runtime::{self, registry::ActivityRegistry};
//! use durable_core::{Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(InMemoryProvider::new());
//! let activities = ActivityRegistry::builder()
//!     .register("Hello", |_ctx, name: String| async move { Ok::<_, String>(format!("Hello, {name}!")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("Greeter", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.schedule_activity("Hello", name).into_activity().await
//!     })
//!     .build();
//! let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
//! let client = Client::new(store);
//! client.start_orchestration("inst-1", "Greeter", "World").await.unwrap();
//! let status = client
//!     .wait_for_orchestration("inst-1", std::time::Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! assert!(matches!(status, OrchestrationStatus::Completed { .. }));
//! rt.shutdown(None).await;
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod client;
pub(crate) mod codec;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError, PurgeCriteria, PurgeResult, StartOptions};
pub use futures::{AllOfFuture, DurableFuture, DurableOutput, Either2, FirstOfFuture, JoinFuture, SelectFuture};
pub use providers::{InstanceFilter, InstanceMetadata};
pub use retry::{BackoffStrategy, RetryContext, RetryPolicy};
pub use runtime::lifecycle::RuntimeStatus;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

use runtime::correlation::{Claim, CorrelationTable, Resolved, ScheduledOp};

/// Execution id of the first incarnation of an instance.
pub const INITIAL_EXECUTION_ID: u64 = 1;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Failures
// ============================================================================

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Raised by user code (activities, orchestrations, timeouts). Eligible for retry.
    Application,
    /// Orchestration code diverged from its recorded history. Never retried.
    Nondeterminism,
    /// Missing registrations and similar setup problems.
    Configuration,
    /// Provider or runtime plumbing failures.
    Infrastructure,
}

/// Structured description of a failed operation or orchestration.
///
/// The original error type name is preserved so orchestration code (and retry
/// predicates) can ask whether a failure was caused by a particular error type,
/// including through the nested cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub category: FailureCategory,
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_failure: Option<Box<FailureDetail>>,
}

impl FailureDetail {
    /// Application failure with an explicit error type name.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Application,
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
            inner_failure: None,
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Nondeterminism,
            ..Self::new("NondeterminismError", message)
        }
    }

    pub fn configuration(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Configuration,
            ..Self::new(error_type, message)
        }
    }

    pub fn infrastructure(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let operation = operation.into();
        Self {
            category: FailureCategory::Infrastructure,
            ..Self::new("InfrastructureError", format!("{operation}: {}", message.into()))
        }
    }

    /// Failure raised when an attempt exceeds its timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("TimeoutError", message)
    }

    pub fn with_inner(mut self, inner: FailureDetail) -> Self {
        self.inner_failure = Some(Box::new(inner));
        self
    }

    /// True when this failure was raised with the given error type name.
    pub fn is_caused_by(&self, error_type: &str) -> bool {
        self.error_type == error_type
    }

    /// True when this failure or any nested cause carries the given error type name.
    pub fn chain_contains(&self, error_type: &str) -> bool {
        self.is_caused_by(error_type) || self.inner_failure.as_deref().is_some_and(|i| i.chain_contains(error_type))
    }

    pub fn is_nondeterminism(&self) -> bool {
        self.category == FailureCategory::Nondeterminism
    }

    /// Only application failures are eligible for retry.
    pub fn is_retryable(&self) -> bool {
        self.category == FailureCategory::Application
    }

    pub fn display_message(&self) -> String {
        format!("{}: {}", self.error_type, self.message)
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())?;
        if let Some(inner) = &self.inner_failure {
            write!(f, " (caused by {inner})")?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureDetail {}

impl From<String> for FailureDetail {
    fn from(message: String) -> Self {
        Self::new("ApplicationError", message)
    }
}

impl From<&str> for FailureDetail {
    fn from(message: &str) -> Self {
        message.to_string().into()
    }
}

impl From<FailureDetail> for String {
    fn from(failure: FailureDetail) -> Self {
        failure.display_message()
    }
}

// ============================================================================
// History
// ============================================================================

/// One persisted history record.
///
/// `event_id` is the 1-based position of the event in its instance history.
/// Completion events carry the `event_id` of the scheduling event they resolve
/// in `source_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<u64>,
    pub instance_id: String,
    pub execution_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    OrchestrationStarted {
        name: String,
        version: String,
        input: String,
        #[serde(default)]
        parent_instance: Option<String>,
        #[serde(default)]
        parent_id: Option<u64>,
        #[serde(default)]
        parent_execution_id: Option<u64>,
        #[serde(default)]
        scheduled_start_ms: Option<u64>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    ActivityScheduled {
        name: String,
        input: String,
    },
    ActivityCompleted {
        result: String,
    },
    ActivityFailed {
        details: FailureDetail,
    },
    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        name: String,
    },
    ExternalEvent {
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        details: FailureDetail,
    },
    OrchestrationSuspended {
        reason: String,
    },
    OrchestrationResumed {
        reason: String,
    },
    OrchestrationTerminated {
        reason: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        details: FailureDetail,
    },
}

impl Event {
    /// Build an event stamped with the current wall-clock time.
    pub fn with_event_id(
        event_id: u64,
        instance_id: impl Into<String>,
        execution_id: u64,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id,
            source_event_id,
            instance_id: instance_id.into(),
            execution_id,
            timestamp_ms: now_ms(),
            kind,
        }
    }

    /// Completed, Failed and Terminated end an instance's history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationTerminated { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::ExternalSubscribed { .. } => "ExternalSubscribed",
            EventKind::ExternalEvent { .. } => "ExternalEvent",
            EventKind::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::OrchestrationSuspended { .. } => "OrchestrationSuspended",
            EventKind::OrchestrationResumed { .. } => "OrchestrationResumed",
            EventKind::OrchestrationTerminated { .. } => "OrchestrationTerminated",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed",
        }
    }
}

/// Commands decided by a pass, dispatched by the runtime after persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
}

// ============================================================================
// Orchestration context
// ============================================================================

struct CtxInner {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    orchestration_version: String,
    table: CorrelationTable,
    new_events: Vec<Event>,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
    /// Misuse of the context API detected during the pass.
    misuse: Option<FailureDetail>,
    logical_time_ms: u64,
}

impl CtxInner {
    fn new(history: &[Event], instance_id: String, execution_id: u64, next_event_id: u64) -> Self {
        let mut table = CorrelationTable::new(next_event_id);
        let mut logical_time_ms = 0;
        let mut orchestration_name = String::new();
        let mut orchestration_version = String::new();

        for e in history {
            match &e.kind {
                EventKind::OrchestrationStarted { name, version, .. } => {
                    orchestration_name = name.clone();
                    orchestration_version = version.clone();
                    logical_time_ms = e.timestamp_ms;
                }
                EventKind::ActivityScheduled { name, input } => table.register_recorded(
                    e.event_id,
                    ScheduledOp::Activity {
                        name: name.clone(),
                        input: input.clone(),
                    },
                ),
                EventKind::TimerCreated { fire_at_ms } => {
                    table.register_recorded(e.event_id, ScheduledOp::Timer { fire_at_ms: *fire_at_ms })
                }
                EventKind::ExternalSubscribed { name } => {
                    table.register_recorded(e.event_id, ScheduledOp::External { name: name.clone() })
                }
                EventKind::SubOrchestrationScheduled { name, instance, input } => table.register_recorded(
                    e.event_id,
                    ScheduledOp::SubOrchestration {
                        name: name.clone(),
                        version: None,
                        instance: instance.clone(),
                        input: input.clone(),
                    },
                ),
                EventKind::ActivityCompleted { result } => {
                    Self::resolve_from(&mut table, e, DurableOutput::Activity(Ok(result.clone())))
                }
                EventKind::ActivityFailed { details } => {
                    Self::resolve_from(&mut table, e, DurableOutput::Activity(Err(details.clone())))
                }
                EventKind::TimerFired { .. } => Self::resolve_from(&mut table, e, DurableOutput::Timer),
                EventKind::SubOrchestrationCompleted { result } => Self::resolve_from(
                    &mut table,
                    e,
                    DurableOutput::SubOrchestration(Ok(result.clone())),
                ),
                EventKind::SubOrchestrationFailed { details } => Self::resolve_from(
                    &mut table,
                    e,
                    DurableOutput::SubOrchestration(Err(details.clone())),
                ),
                EventKind::ExternalEvent { name, data } => table.deliver_external(
                    name,
                    Resolved {
                        event_id: e.event_id,
                        timestamp_ms: e.timestamp_ms,
                        output: DurableOutput::External(data.clone()),
                    },
                ),
                _ => {}
            }
        }

        Self {
            instance_id,
            execution_id,
            orchestration_name,
            orchestration_version,
            table,
            new_events: Vec::new(),
            actions: Vec::new(),
            nondeterminism: None,
            misuse: None,
            logical_time_ms,
        }
    }

    fn resolve_from(table: &mut CorrelationTable, e: &Event, output: DurableOutput) {
        if let Some(source) = e.source_event_id {
            table.resolve(
                source,
                Resolved {
                    event_id: e.event_id,
                    timestamp_ms: e.timestamp_ms,
                    output,
                },
            );
        }
    }

    fn push_event(&mut self, event_id: u64, kind: EventKind) {
        let mut event = Event::with_event_id(event_id, self.instance_id.clone(), self.execution_id, None, kind);
        // Keep history timestamps monotonic with the logical clock.
        event.timestamp_ms = event.timestamp_ms.max(self.logical_time_ms);
        self.new_events.push(event);
    }

    fn observe(&mut self, resolved: &Resolved) {
        self.logical_time_ms = self.logical_time_ms.max(resolved.timestamp_ms);
    }
}

/// Handle passed to orchestration code. Cheap to clone; all clones share the
/// state of the current execution pass.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context that replays `history`. New events are numbered from
    /// `next_event_id`.
    pub fn new(history: &[Event], instance_id: impl Into<String>, execution_id: u64, next_event_id: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                history,
                instance_id.into(),
                execution_id,
                next_event_id,
            ))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration_name.clone()
    }

    pub fn orchestration_version(&self) -> String {
        self.lock().orchestration_version.clone()
    }

    /// Deterministic current time: the latest history timestamp observed so far.
    pub fn utc_now_ms(&self) -> u64 {
        self.lock().logical_time_ms
    }

    /// True while the code is re-executing decisions already recorded in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().table.is_replaying()
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule(ScheduledOp::Activity {
            name: name.into(),
            input: input.into(),
        })
    }

    /// Schedule an activity with a serde-encoded input and decode its output.
    pub async fn schedule_activity_typed<In, Out>(&self, name: &str, input: &In) -> Result<Out, FailureDetail>
    where
        In: Serialize + Sync,
        Out: serde::de::DeserializeOwned,
    {
        let payload = codec::Json::encode(input)?;
        let raw = self.schedule_activity(name, payload).into_activity().await?;
        codec::Json::decode(&raw)
    }

    /// Fire after `delay`. A new timer counts from wall time when the logical
    /// clock lags behind it; a replayed timer keeps its recorded fire time.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let base = self.lock().logical_time_ms.max(now_ms());
        let fire_at_ms = base.saturating_add(delay.as_millis() as u64);
        self.schedule(ScheduledOp::Timer { fire_at_ms })
    }

    /// Wait for the next external event raised with `name`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        self.schedule(ScheduledOp::External { name: name.into() })
    }

    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_sub_orchestration_versioned(name, None, input)
    }

    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: Option<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        self.schedule(ScheduledOp::SubOrchestration {
            name: name.into(),
            version,
            instance: String::new(),
            input: input.into(),
        })
    }

    /// Register `op` with the correlation table. A new operation records its
    /// scheduling event and command; a replayed one claims the recorded event.
    fn schedule(&self, op: ScheduledOp) -> DurableFuture {
        let mut inner = self.lock();
        if inner.nondeterminism.is_some() {
            return DurableFuture::poisoned(self.clone());
        }
        let seq = match inner.table.register(op.clone()) {
            Ok(Claim::Replayed(seq)) => return DurableFuture::new(self.clone(), seq),
            Ok(Claim::New(seq)) => seq,
            Err(message) => {
                tracing::debug!(target: "durable_core::orchestration", %message, "schedule mismatch during replay");
                inner.nondeterminism = Some(message);
                return DurableFuture::poisoned(self.clone());
            }
        };
        let (kind, action) = match op {
            ScheduledOp::Activity { name, input } => (
                EventKind::ActivityScheduled {
                    name: name.clone(),
                    input: input.clone(),
                },
                Action::CallActivity {
                    scheduling_event_id: seq,
                    name,
                    input,
                },
            ),
            ScheduledOp::Timer { fire_at_ms } => (
                EventKind::TimerCreated { fire_at_ms },
                Action::CreateTimer {
                    scheduling_event_id: seq,
                    fire_at_ms,
                },
            ),
            ScheduledOp::External { name } => (
                EventKind::ExternalSubscribed { name: name.clone() },
                Action::WaitExternal {
                    scheduling_event_id: seq,
                    name,
                },
            ),
            ScheduledOp::SubOrchestration {
                name, version, input, ..
            } => {
                let instance = format!("{}::sub::{seq}", inner.instance_id);
                inner.table.set_sub_orchestration_instance(seq, instance.clone());
                (
                    EventKind::SubOrchestrationScheduled {
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    },
                    Action::StartSubOrchestration {
                        scheduling_event_id: seq,
                        name,
                        version,
                        instance,
                        input,
                    },
                )
            }
        };
        inner.push_event(seq, kind);
        inner.actions.push(action);
        DurableFuture::new(self.clone(), seq)
    }

    /// Resolution for a scheduled operation, advancing the logical clock.
    pub(crate) fn take_resolution(&self, seq: u64) -> Option<Resolved> {
        let mut inner = self.lock();
        if inner.nondeterminism.is_some() {
            return None;
        }
        let resolved = inner.table.resolution(seq)?;
        inner.observe(&resolved);
        Some(resolved)
    }

    /// Resolution without moving the logical clock; used by combinators to rank members.
    pub(crate) fn peek_resolution(&self, seq: u64) -> Option<Resolved> {
        let inner = self.lock();
        if inner.nondeterminism.is_some() {
            return None;
        }
        inner.table.resolution(seq)
    }

    pub(crate) fn observe(&self, resolved: &Resolved) {
        self.lock().observe(resolved);
    }

    pub(crate) fn nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.clone()
    }

    /// Fail the current pass. The first reported misuse wins.
    pub(crate) fn report_misuse(&self, failure: FailureDetail) {
        self.lock().misuse.get_or_insert(failure);
    }

    pub(crate) fn misuse(&self) -> Option<FailureDetail> {
        self.lock().misuse.clone()
    }

    pub(crate) fn unclaimed_recorded(&self) -> usize {
        self.lock().table.unclaimed()
    }

    pub(crate) fn next_event_id(&self) -> u64 {
        self.lock().table.next_seq()
    }

    pub(crate) fn take_new_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.lock().new_events)
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }
}

// ============================================================================
// Activity context
// ============================================================================

/// Metadata handed to an activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    activity_name: String,
    activity_id: u64,
    worker_id: String,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        execution_id: u64,
        orchestration_name: String,
        activity_name: String,
        activity_id: u64,
        worker_id: String,
    ) -> Self {
        Self {
            instance_id,
            execution_id,
            orchestration_name,
            activity_name,
            activity_id,
            worker_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.orchestration_name
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Event id of the scheduling event this invocation resolves.
    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "durable_core::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "durable_core::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.into()
        );
    }
}
