//! Storage and queue abstraction.
//!
//! A provider owns three things per deployment: the append-only history of
//! every instance, the instance records (a projection of history), and two
//! peek-lock queues. The orchestrator queue carries everything that drives an
//! execution pass (starts, completions, timer firings, external events and
//! control requests); the worker queue carries activity executions.
//!
//! Fetching from the orchestrator queue locks the whole instance: no other
//! dispatcher receives messages for it until the batch is acknowledged,
//! abandoned, or its lock expires. That lock is what serializes passes.

use crate::runtime::lifecycle::{ControlOp, InstanceProjection, RuntimeStatus};
use crate::{Event, FailureDetail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod error;
pub mod fs;
pub mod in_memory;
pub mod management;
mod store_state;

pub use error::ProviderError;
pub use management::ManagementProvider;

/// Messages exchanged through the provider queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        version: Option<String>,
        input: String,
        execution_id: u64,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
        parent_execution_id: Option<u64>,
        scheduled_start_ms: Option<u64>,
        tags: BTreeMap<String, String>,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        orchestration: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: FailureDetail,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: FailureDetail,
    },
    SuspendInstance {
        instance: String,
        reason: String,
    },
    ResumeInstance {
        instance: String,
        reason: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Instance whose queue this message belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }

    pub fn control_op(&self) -> Option<ControlOp> {
        match self {
            WorkItem::SuspendInstance { .. } => Some(ControlOp::Suspend),
            WorkItem::ResumeInstance { .. } => Some(ControlOp::Resume),
            WorkItem::TerminateInstance { .. } => Some(ControlOp::Terminate),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::SuspendInstance { .. } => "SuspendInstance",
            WorkItem::ResumeInstance { .. } => "ResumeInstance",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
        }
    }
}

/// Stored instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub name: String,
    /// Resolved when the first pass runs.
    pub version: Option<String>,
    pub status: RuntimeStatus,
    pub input: String,
    pub output: Option<String>,
    pub failure: Option<FailureDetail>,
    pub created_at_ms: u64,
    pub last_updated_ms: u64,
    pub scheduled_start_ms: Option<u64>,
    pub tags: BTreeMap<String, String>,
    pub parent_instance: Option<String>,
    pub execution_id: u64,
    /// Filled in only by queries that ask for it.
    #[serde(skip)]
    pub history: Option<Vec<Event>>,
}

impl InstanceMetadata {
    /// Pending record for a start request.
    pub fn pending(start: &WorkItem, now_ms: u64) -> Option<Self> {
        let WorkItem::StartOrchestration {
            instance,
            orchestration,
            version,
            input,
            execution_id,
            parent_instance,
            scheduled_start_ms,
            tags,
            ..
        } = start
        else {
            return None;
        };
        Some(Self {
            instance_id: instance.clone(),
            name: orchestration.clone(),
            version: version.clone(),
            status: RuntimeStatus::Pending,
            input: input.clone(),
            output: None,
            failure: None,
            created_at_ms: now_ms,
            last_updated_ms: now_ms,
            scheduled_start_ms: *scheduled_start_ms,
            tags: tags.clone(),
            parent_instance: parent_instance.clone(),
            execution_id: *execution_id,
            history: None,
        })
    }

    pub(crate) fn apply_projection(&mut self, projection: &InstanceProjection, now_ms: u64) {
        self.name = projection.name.clone();
        self.version = Some(projection.version.clone());
        self.status = projection.status;
        self.input = projection.input.clone();
        self.output = projection.output.clone();
        self.failure = projection.failure.clone();
        self.scheduled_start_ms = projection.scheduled_start_ms;
        self.tags = projection.tags.clone();
        self.parent_instance = projection.parent_instance.clone();
        self.last_updated_ms = now_ms;
    }
}

/// Query filter over instance records. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub statuses: Option<Vec<RuntimeStatus>>,
    /// Inclusive lower bound on creation time.
    pub created_from_ms: Option<u64>,
    /// Exclusive upper bound on creation time.
    pub created_to_ms: Option<u64>,
    pub instance_id_prefix: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, record: &InstanceMetadata) -> bool {
        self.statuses.as_ref().is_none_or(|s| s.contains(&record.status))
            && self.created_from_ms.is_none_or(|from| record.created_at_ms >= from)
            && self.created_to_ms.is_none_or(|to| record.created_at_ms < to)
            && self
                .instance_id_prefix
                .as_ref()
                .is_none_or(|p| record.instance_id.starts_with(p.as_str()))
    }
}

/// A locked batch of orchestrator messages for one instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub execution_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub metadata: Option<InstanceMetadata>,
    pub lock_token: String,
}

/// Everything persisted atomically when a pass is acknowledged.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationAck {
    pub history_delta: Vec<Event>,
    pub worker_items: Vec<WorkItem>,
    /// Messages for other instances (child starts, parent completions, cascaded terminations).
    pub orchestrator_items: Vec<WorkItem>,
    /// `TimerFired` messages, each invisible until its `fire_at_ms`.
    pub timer_items: Vec<WorkItem>,
    /// Projection of the instance's full history after the delta.
    pub projection: Option<InstanceProjection>,
}

/// Result of asking a provider to create an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { execution_id: u64 },
    Exists { status: RuntimeStatus },
}

/// Result of submitting a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAdmission {
    Accepted { previous: RuntimeStatus },
    Rejected { message: String },
    NotFound,
}

/// Result of purging a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Deleted,
    NotFound,
    NotTerminal { status: RuntimeStatus },
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Full history of an instance; empty when the instance is unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Create the record for `start` and enqueue it, invisible until `visible_at_ms`.
    ///
    /// An existing instance is left alone and reported as `Exists`, unless
    /// `replace_terminal` is set and the existing instance is terminal: then its
    /// history and pending messages are discarded and a new incarnation with
    /// the next execution id takes its place.
    async fn create_instance(
        &self,
        start: WorkItem,
        visible_at_ms: u64,
        replace_terminal: bool,
    ) -> Result<CreateOutcome, ProviderError>;

    /// Enqueue a message for an instance's next pass.
    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Validate a control request against the effective status and enqueue it,
    /// atomically with respect to other control requests.
    async fn enqueue_control(&self, item: WorkItem) -> Result<ControlAdmission, ProviderError>;

    /// Lock the next instance with visible messages and return its batch.
    async fn fetch_orchestration_item(&self, lock_timeout: Duration)
    -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Persist a pass and release the instance lock. Fails if the lock was lost.
    async fn ack_orchestration_item(&self, lock_token: &str, ack: OrchestrationAck) -> Result<(), ProviderError>;

    /// Release the instance lock without persisting; messages become visible after `delay`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>)
    -> Result<(), ProviderError>;

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove an executed activity and enqueue its completion atomically.
    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceMetadata>, ProviderError>;

    /// Administrative capability, when supported.
    fn as_management(&self) -> Option<&dyn ManagementProvider> {
        None
    }
}
