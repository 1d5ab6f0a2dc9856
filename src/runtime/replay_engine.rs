use crate::runtime::OrchestrationHandler;
use crate::runtime::lifecycle::{ControlOp, RuntimeStatus, apply_control, project_history};
use crate::{Action, Event, EventKind, FailureCategory, FailureDetail, OrchestrationContext, providers::WorkItem};
use futures::task::noop_waker_ref;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Result of executing an orchestration pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Pass ended at an unresolved await; the orchestration continues
    Continue,
    /// Orchestration completed with output
    Completed(String),
    /// Orchestration failed
    Failed(FailureDetail),
    /// Orchestration was terminated in this pass
    Terminated(String),
    /// Instance is suspended; deliveries were recorded but no code ran
    Suspended,
    /// History already ends in a terminal event; late deliveries were recorded
    AlreadyTerminal,
}

/// Data recorded in `OrchestrationStarted` for a new instance.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub name: String,
    pub version: String,
    pub input: String,
    pub parent_instance: Option<String>,
    pub parent_id: Option<u64>,
    pub parent_execution_id: Option<u64>,
    pub scheduled_start_ms: Option<u64>,
    pub tags: BTreeMap<String, String>,
}

/// Replays history and executes one deterministic orchestration pass
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    /// History events generated during this pass
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch after persistence
    pub(crate) pending_actions: Vec<Action>,
    /// History at the start of the pass
    pub(crate) baseline_history: Vec<Event>,
    /// Next event_id for new events added this pass
    pub(crate) next_event_id: u64,
    /// Failure that aborts the pass before any orchestration code runs
    pub(crate) abort_error: Option<FailureDetail>,
}

impl ReplayEngine {
    pub fn new(instance: String, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.last().map(|e| e.event_id + 1).unwrap_or(1);
        Self {
            instance,
            execution_id,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            baseline_history,
            next_event_id,
            abort_error: None,
        }
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn append(&mut self, source_event_id: Option<u64>, kind: EventKind) {
        let event = Event::with_event_id(
            self.next_event_id,
            self.instance.clone(),
            self.execution_id,
            source_event_id,
            kind,
        );
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    /// Status implied by baseline plus delta; `Pending` before the start event.
    pub fn current_status(&self) -> RuntimeStatus {
        let history: Vec<Event> = self.all_events().cloned().collect();
        project_history(&history)
            .map(|p| p.status)
            .unwrap_or(RuntimeStatus::Pending)
    }

    pub fn is_started(&self) -> bool {
        self.all_events()
            .any(|e| matches!(e.kind, EventKind::OrchestrationStarted { .. }))
    }

    /// Record `OrchestrationStarted` for an instance without history. No-op
    /// when the instance already started.
    pub fn start(&mut self, request: StartRequest) {
        if self.is_started() {
            debug!(instance = %self.instance, "ignoring duplicate start");
            return;
        }
        self.append(
            None,
            EventKind::OrchestrationStarted {
                name: request.name,
                version: request.version,
                input: request.input,
                parent_instance: request.parent_instance,
                parent_id: request.parent_id,
                parent_execution_id: request.parent_execution_id,
                scheduled_start_ms: request.scheduled_start_ms,
                tags: request.tags,
            },
        );
    }

    /// Kind of the scheduling event with id `seq`, if any.
    fn scheduled_kind(&self, seq: u64) -> Option<&'static str> {
        self.all_events().find(|e| e.event_id == seq).and_then(|e| match e.kind {
            EventKind::ActivityScheduled { .. } => Some("activity"),
            EventKind::TimerCreated { .. } => Some("timer"),
            EventKind::SubOrchestrationScheduled { .. } => Some("sub-orchestration"),
            EventKind::ExternalSubscribed { .. } => Some("external"),
            _ => None,
        })
    }

    fn already_resolved(&self, seq: u64) -> bool {
        self.all_events().any(|e| {
            e.source_event_id == Some(seq)
                && matches!(
                    e.kind,
                    EventKind::ActivityCompleted { .. }
                        | EventKind::ActivityFailed { .. }
                        | EventKind::TimerFired { .. }
                        | EventKind::SubOrchestrationCompleted { .. }
                        | EventKind::SubOrchestrationFailed { .. }
                )
        })
    }

    /// Stage 1: turn delivered messages into history events.
    ///
    /// Stale-incarnation messages, duplicates and completions for unknown
    /// sequence ids are dropped. A completion whose scheduling event has a
    /// different kind aborts the pass as nondeterminism.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(
            instance = %self.instance,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            let (seq, expected, execution_id, kind) = match msg {
                WorkItem::StartOrchestration { .. } => {
                    if self.is_started() {
                        debug!(instance = %self.instance, "ignoring duplicate start message");
                    }
                    continue;
                }
                WorkItem::ActivityExecute { .. } => {
                    warn!(instance = %self.instance, "activity execution routed to the orchestrator queue, dropping");
                    continue;
                }
                WorkItem::ExternalRaised { name, data, .. } => {
                    self.append(None, EventKind::ExternalEvent { name, data });
                    continue;
                }
                WorkItem::SuspendInstance { reason, .. } => {
                    self.apply_control(ControlOp::Suspend, EventKind::OrchestrationSuspended { reason });
                    continue;
                }
                WorkItem::ResumeInstance { reason, .. } => {
                    self.apply_control(ControlOp::Resume, EventKind::OrchestrationResumed { reason });
                    continue;
                }
                WorkItem::TerminateInstance { reason, .. } => {
                    self.apply_control(ControlOp::Terminate, EventKind::OrchestrationTerminated { reason });
                    continue;
                }
                WorkItem::ActivityCompleted {
                    execution_id, id, result, ..
                } => (id, "activity", execution_id, EventKind::ActivityCompleted { result }),
                WorkItem::ActivityFailed {
                    execution_id,
                    id,
                    details,
                    ..
                } => (id, "activity", execution_id, EventKind::ActivityFailed { details }),
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } => (id, "timer", execution_id, EventKind::TimerFired { fire_at_ms }),
                WorkItem::SubOrchCompleted {
                    parent_execution_id,
                    parent_id,
                    result,
                    ..
                } => (
                    parent_id,
                    "sub-orchestration",
                    parent_execution_id,
                    EventKind::SubOrchestrationCompleted { result },
                ),
                WorkItem::SubOrchFailed {
                    parent_execution_id,
                    parent_id,
                    details,
                    ..
                } => (
                    parent_id,
                    "sub-orchestration",
                    parent_execution_id,
                    EventKind::SubOrchestrationFailed { details },
                ),
            };

            if execution_id != self.execution_id {
                warn!(
                    instance = %self.instance,
                    id = seq,
                    message_execution_id = execution_id,
                    execution_id = self.execution_id,
                    "ignoring completion from a previous execution"
                );
                continue;
            }
            if self.already_resolved(seq) {
                warn!(instance = %self.instance, id = seq, "ignoring duplicate completion");
                continue;
            }
            match self.scheduled_kind(seq) {
                Some(kind_name) if kind_name == expected => {
                    if let EventKind::ActivityFailed { details } | EventKind::SubOrchestrationFailed { details } = &kind
                        && is_system_failure(details)
                    {
                        warn!(instance = %self.instance, id = seq, error = %details, "system failure aborts the pass");
                        self.abort_error.get_or_insert_with(|| details.clone());
                    }
                    self.append(Some(seq), kind);
                }
                Some(kind_name) => {
                    let details = FailureDetail::nondeterminism(format!(
                        "completion kind mismatch for id={seq}, expected '{kind_name}', got '{expected}'"
                    ));
                    warn!(instance = %self.instance, error = %details, "detected nondeterminism in completion batch");
                    self.abort_error.get_or_insert(details);
                }
                None => {
                    warn!(instance = %self.instance, id = seq, kind = expected, "ignoring completion for unknown id");
                }
            }
        }

        debug!(
            instance = %self.instance,
            event_count = self.history_delta.len(),
            "completion events created"
        );
    }

    fn apply_control(&mut self, op: ControlOp, kind: EventKind) {
        match apply_control(op, self.current_status()) {
            Ok(_) => self.append(None, kind),
            Err(message) => warn!(instance = %self.instance, %message, "ignoring control request"),
        }
    }

    /// Outcome decided without running orchestration code, if any.
    fn precheck(&mut self) -> Option<TurnResult> {
        if self.baseline_history.iter().any(Event::is_terminal) {
            return Some(TurnResult::AlreadyTerminal);
        }
        if let Some(reason) = self.history_delta.iter().find_map(|e| match &e.kind {
            EventKind::OrchestrationTerminated { reason } => Some(reason.clone()),
            _ => None,
        }) {
            return Some(TurnResult::Terminated(reason));
        }
        if let Some(err) = self.abort_error.clone() {
            return Some(self.fail(err));
        }
        if self.current_status() == RuntimeStatus::Suspended {
            debug!(instance = %self.instance, "instance suspended, skipping pass");
            return Some(TurnResult::Suspended);
        }
        None
    }

    /// Fail the instance without running code (e.g. no handler is registered),
    /// unless a pass would not run anyway.
    pub fn fail_without_running(&mut self, details: FailureDetail) -> TurnResult {
        match self.precheck() {
            Some(result) => result,
            None => self.fail(details),
        }
    }

    /// Stage 2: run one pass of the orchestration over baseline plus delta.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(result) = self.precheck() {
            return result;
        }

        debug!(instance = %self.instance, execution_id = self.execution_id, "executing orchestration pass");
        let history: Vec<Event> = self.all_events().cloned().collect();
        let ctx = OrchestrationContext::new(&history, self.instance.clone(), self.execution_id, self.next_event_id);

        let polled = catch_unwind(AssertUnwindSafe(|| {
            let mut fut = handler.invoke(ctx.clone(), input);
            let mut cx = Context::from_waker(noop_waker_ref());
            fut.as_mut().poll(&mut cx)
        }));

        let outcome = match polled {
            Ok(Poll::Ready(result)) => Some(result),
            Ok(Poll::Pending) => None,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "orchestration panicked".to_string());
                Some(Err(FailureDetail::new("OrchestrationPanicked", message)))
            }
        };

        if let Some(message) = ctx.nondeterminism() {
            return self.fail(FailureDetail::nondeterminism(message));
        }
        if let Some(failure) = ctx.misuse() {
            return self.fail(failure);
        }
        let unclaimed = ctx.unclaimed_recorded();
        if unclaimed > 0 {
            return self.fail(FailureDetail::nondeterminism(format!(
                "nondeterministic: {unclaimed} recorded scheduling event(s) were not reproduced by the orchestration"
            )));
        }

        self.history_delta.extend(ctx.take_new_events());
        self.pending_actions = ctx.take_actions();
        self.next_event_id = ctx.next_event_id();

        match outcome {
            None => TurnResult::Continue,
            Some(Ok(output)) => {
                self.append(None, EventKind::OrchestrationCompleted { output: output.clone() });
                TurnResult::Completed(output)
            }
            Some(Err(details)) => {
                self.append(None, EventKind::OrchestrationFailed { details: details.clone() });
                TurnResult::Failed(details)
            }
        }
    }

    /// Fail the pass without committing anything the code decided.
    fn fail(&mut self, details: FailureDetail) -> TurnResult {
        warn!(instance = %self.instance, error = %details, "orchestration failed");
        self.pending_actions.clear();
        self.append(None, EventKind::OrchestrationFailed { details: details.clone() });
        TurnResult::Failed(details)
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    /// Check if this pass added history
    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }

    pub fn final_history(&self) -> Vec<Event> {
        self.all_events().cloned().collect()
    }
}

/// Configuration and infrastructure failures are not the orchestration's to handle.
fn is_system_failure(details: &FailureDetail) -> bool {
    matches!(
        details.category,
        FailureCategory::Configuration | FailureCategory::Infrastructure
    )
}
