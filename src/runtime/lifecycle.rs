//! Instance lifecycle rules.
//!
//! The status of an instance is a projection of its history. Control requests
//! (suspend, resume, terminate) are validated against the effective status:
//! the stored status with any still-queued control requests applied on top.

use crate::{Event, EventKind, FailureDetail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Externally visible state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Suspended,
}

impl RuntimeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::Suspended => "Suspended",
        }
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlOp {
    Suspend,
    Resume,
    Terminate,
}

impl ControlOp {
    fn verb(self) -> &'static str {
        match self {
            ControlOp::Suspend => "suspend",
            ControlOp::Resume => "resume",
            ControlOp::Terminate => "terminate",
        }
    }
}

/// Status after applying `op` to an instance currently in `current`, or the
/// message explaining why the transition is not allowed.
pub fn apply_control(op: ControlOp, current: RuntimeStatus) -> Result<RuntimeStatus, String> {
    let next = match (op, current) {
        (ControlOp::Suspend, RuntimeStatus::Pending | RuntimeStatus::Running) => Some(RuntimeStatus::Suspended),
        (ControlOp::Resume, RuntimeStatus::Suspended) => Some(RuntimeStatus::Running),
        (ControlOp::Terminate, RuntimeStatus::Pending | RuntimeStatus::Running | RuntimeStatus::Suspended) => {
            Some(RuntimeStatus::Terminated)
        }
        _ => None,
    };
    next.ok_or_else(|| {
        format!(
            "Cannot {} orchestration instance in the {} state.",
            op.verb(),
            current
        )
    })
}

/// Fold queued control requests over a stored status.
pub fn effective_status(stored: RuntimeStatus, queued: impl IntoIterator<Item = ControlOp>) -> RuntimeStatus {
    queued
        .into_iter()
        .fold(stored, |status, op| apply_control(op, status).unwrap_or(status))
}

/// Everything the instance record derives from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProjection {
    pub name: String,
    pub version: String,
    pub input: String,
    pub status: RuntimeStatus,
    pub output: Option<String>,
    pub failure: Option<FailureDetail>,
    pub parent_instance: Option<String>,
    pub scheduled_start_ms: Option<u64>,
    pub tags: BTreeMap<String, String>,
}

/// Project an instance's history. `None` for an empty history or one that
/// lacks its start event.
pub fn project_history(history: &[Event]) -> Option<InstanceProjection> {
    let mut projection = history.iter().find_map(|e| match &e.kind {
        EventKind::OrchestrationStarted {
            name,
            version,
            input,
            parent_instance,
            scheduled_start_ms,
            tags,
            ..
        } => Some(InstanceProjection {
            name: name.clone(),
            version: version.clone(),
            input: input.clone(),
            status: RuntimeStatus::Running,
            output: None,
            failure: None,
            parent_instance: parent_instance.clone(),
            scheduled_start_ms: *scheduled_start_ms,
            tags: tags.clone(),
        }),
        _ => None,
    })?;

    for e in history {
        if projection.status.is_terminal() {
            break;
        }
        match &e.kind {
            EventKind::OrchestrationSuspended { .. } => projection.status = RuntimeStatus::Suspended,
            EventKind::OrchestrationResumed { .. } => projection.status = RuntimeStatus::Running,
            EventKind::OrchestrationCompleted { output } => {
                projection.status = RuntimeStatus::Completed;
                projection.output = Some(output.clone());
            }
            EventKind::OrchestrationFailed { details } => {
                projection.status = RuntimeStatus::Failed;
                projection.failure = Some(details.clone());
            }
            EventKind::OrchestrationTerminated { reason } => {
                projection.status = RuntimeStatus::Terminated;
                projection.output = Some(reason.clone());
            }
            _ => {}
        }
    }
    Some(projection)
}
