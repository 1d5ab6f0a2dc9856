use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Json;
use crate::providers::{
    ControlAdmission, CreateOutcome, InstanceFilter, InstanceMetadata, ManagementProvider, Provider, ProviderError,
    PurgeOutcome, WorkItem,
};
use crate::runtime::OrchestrationStatus;
use crate::runtime::lifecycle::RuntimeStatus;
use crate::INITIAL_EXECUTION_ID;
use serde::Serialize;
use tracing::debug;

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The instance does not exist.
    NotFound { instance: String },
    /// An instance with this id already exists.
    AlreadyExists { instance: String, status: RuntimeStatus },
    /// The operation is not valid for the instance's current state. Nothing changed.
    InvalidOperation { message: String },
    /// `wait_for_orchestration` gave up before the instance finished.
    Timeout,
    /// The provider does not offer the capability the operation needs.
    Unsupported { operation: &'static str },
    Provider(ProviderError),
    Serialization(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound { instance } => write!(f, "instance '{instance}' not found"),
            ClientError::AlreadyExists { instance, status } => {
                write!(f, "instance '{instance}' already exists ({status})")
            }
            ClientError::InvalidOperation { message } => f.write_str(message),
            ClientError::Timeout => f.write_str("timed out waiting for orchestration"),
            ClientError::Unsupported { operation } => {
                write!(f, "{operation} requires a provider with management support")
            }
            ClientError::Provider(e) => write!(f, "provider error: {e}"),
            ClientError::Serialization(message) => write!(f, "serialization error: {message}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Options for [`Client::schedule_new_orchestration`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Instance id; a random UUID when absent.
    pub instance_id: Option<String>,
    /// Exact orchestration version; the registry's policy decides when absent.
    pub version: Option<String>,
    /// Do not start before this time (ms since the epoch). The instance stays Pending until then.
    pub start_at_ms: Option<u64>,
    pub tags: BTreeMap<String, String>,
}

/// Purge criteria. Every status listed must be terminal.
#[derive(Debug, Clone, Default)]
pub struct PurgeCriteria {
    /// Defaults to Completed, Failed and Terminated.
    pub statuses: Option<Vec<RuntimeStatus>>,
    /// Inclusive lower bound on creation time.
    pub created_from_ms: Option<u64>,
    /// Exclusive upper bound on creation time.
    pub created_to_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeResult {
    pub deleted: u64,
}

/// Control-plane client.
///
/// Talks to the runtime exclusively through the shared provider: starts and
/// control requests are enqueued, status and history are read from the store.
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    fn management(&self, operation: &'static str) -> Result<&dyn ManagementProvider, ClientError> {
        self.store
            .as_management()
            .ok_or(ClientError::Unsupported { operation })
    }

    // ===== Starting instances =====

    /// Start an orchestration instance with string input.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.create(instance.to_string(), orchestration, None, input.into(), None, BTreeMap::new())
            .await
    }

    /// Start an orchestration instance pinned to a specific version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.create(
            instance.to_string(),
            orchestration,
            Some(version.into()),
            input.into(),
            None,
            BTreeMap::new(),
        )
        .await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(|e| ClientError::Serialization(e.message))?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Schedule a new instance and return its id.
    pub async fn schedule_new_orchestration(
        &self,
        orchestration: &str,
        input: impl Into<String>,
        options: StartOptions,
    ) -> Result<String, ClientError> {
        let instance = options
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.create(
            instance.clone(),
            orchestration,
            options.version,
            input.into(),
            options.start_at_ms,
            options.tags,
        )
        .await?;
        Ok(instance)
    }

    async fn create(
        &self,
        instance: String,
        orchestration: &str,
        version: Option<String>,
        input: String,
        start_at_ms: Option<u64>,
        tags: BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let item = WorkItem::StartOrchestration {
            instance: instance.clone(),
            orchestration: orchestration.to_string(),
            version,
            input,
            execution_id: INITIAL_EXECUTION_ID,
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
            scheduled_start_ms: start_at_ms,
            tags,
        };
        let visible_at_ms = start_at_ms.unwrap_or(0);
        match self.store.create_instance(item, visible_at_ms, false).await? {
            CreateOutcome::Created { .. } => {
                debug!(target: "durable_core::runtime", instance = %instance, orchestration, "instance created");
                Ok(())
            }
            CreateOutcome::Exists { status } => Err(ClientError::AlreadyExists { instance, status }),
        }
    }

    /// Re-run a terminal instance with its original name, version and input.
    ///
    /// With `new_instance_id` the copy gets a fresh id (returned); otherwise the
    /// same id is reused, its history discarded and its execution id bumped.
    /// Reusing the id of an instance that has not finished is rejected.
    pub async fn restart_instance(&self, instance: &str, new_instance_id: bool) -> Result<String, ClientError> {
        let record = self
            .store
            .get_instance(instance)
            .await?
            .ok_or_else(|| ClientError::NotFound {
                instance: instance.to_string(),
            })?;
        let target = if new_instance_id {
            uuid::Uuid::new_v4().to_string()
        } else {
            if !record.status.is_terminal() {
                return Err(ClientError::InvalidOperation {
                    message: format!(
                        "Cannot restart orchestration instance in the {} state.",
                        record.status
                    ),
                });
            }
            instance.to_string()
        };
        let item = WorkItem::StartOrchestration {
            instance: target.clone(),
            orchestration: record.name,
            version: record.version,
            input: record.input,
            execution_id: INITIAL_EXECUTION_ID,
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
            scheduled_start_ms: None,
            tags: record.tags,
        };
        match self.store.create_instance(item, 0, !new_instance_id).await? {
            CreateOutcome::Created { execution_id } => {
                debug!(target: "durable_core::runtime", instance = %target, execution_id, "instance restarted");
                Ok(target)
            }
            CreateOutcome::Exists { status } => Err(ClientError::AlreadyExists { instance: target, status }),
        }
    }

    // ===== Events and control =====

    /// Deliver an external event. Events raised before the orchestration
    /// waits for them are buffered.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        if self.store.get_instance(instance).await?.is_none() {
            return Err(ClientError::NotFound {
                instance: instance.to_string(),
            });
        }
        self.store
            .enqueue_orchestrator_work(WorkItem::ExternalRaised {
                instance: instance.to_string(),
                name: event_name.into(),
                data: data.into(),
            })
            .await?;
        Ok(())
    }

    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.control(WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        })
        .await
    }

    pub async fn suspend_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.control(WorkItem::SuspendInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        })
        .await
    }

    pub async fn resume_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.control(WorkItem::ResumeInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        })
        .await
    }

    async fn control(&self, item: WorkItem) -> Result<(), ClientError> {
        let instance = item.instance().to_string();
        let kind = item.kind_name();
        match self.store.enqueue_control(item).await? {
            ControlAdmission::Accepted { previous } => {
                debug!(target: "durable_core::runtime", instance = %instance, kind, %previous, "control request accepted");
                Ok(())
            }
            ControlAdmission::Rejected { message } => Err(ClientError::InvalidOperation { message }),
            ControlAdmission::NotFound => Err(ClientError::NotFound { instance }),
        }
    }

    // ===== Status and queries =====

    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let Some(record) = self.store.get_instance(instance).await? else {
            return Ok(OrchestrationStatus::NotFound);
        };
        Ok(status_of(&record))
    }

    /// Instance record, optionally with its full history. `None` when missing.
    pub async fn get_instance_metadata(
        &self,
        instance: &str,
        include_history: bool,
    ) -> Result<Option<InstanceMetadata>, ClientError> {
        let Some(mut record) = self.store.get_instance(instance).await? else {
            return Ok(None);
        };
        if include_history {
            record.history = Some(self.store.read(instance).await?);
        }
        Ok(Some(record))
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    pub async fn query_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceMetadata>, ClientError> {
        Ok(self.management("query_instances")?.list_instances(filter).await?)
    }

    pub async fn purge_instance(&self, instance: &str) -> Result<PurgeResult, ClientError> {
        match self.management("purge_instance")?.purge_instance(instance).await? {
            PurgeOutcome::Deleted => Ok(PurgeResult { deleted: 1 }),
            PurgeOutcome::NotFound => Ok(PurgeResult { deleted: 0 }),
            PurgeOutcome::NotTerminal { status } => Err(ClientError::InvalidOperation {
                message: format!("Cannot purge orchestration instance in the {status} state."),
            }),
        }
    }

    /// Purge terminal instances by status and creation-time range.
    pub async fn purge_instances(&self, criteria: PurgeCriteria) -> Result<PurgeResult, ClientError> {
        let statuses = criteria.statuses.unwrap_or_else(|| {
            vec![
                RuntimeStatus::Completed,
                RuntimeStatus::Failed,
                RuntimeStatus::Terminated,
            ]
        });
        if let Some(status) = statuses.iter().find(|s| !s.is_terminal()) {
            return Err(ClientError::InvalidOperation {
                message: format!("Cannot purge orchestration instances in the {status} state."),
            });
        }
        let filter = InstanceFilter {
            statuses: Some(statuses),
            created_from_ms: criteria.created_from_ms,
            created_to_ms: criteria.created_to_ms,
            instance_id_prefix: None,
        };
        let deleted = self.management("purge_instances")?.purge_instances(&filter).await?;
        debug!(target: "durable_core::runtime", deleted, "instances purged");
        Ok(PurgeResult { deleted })
    }
}

fn status_of(record: &InstanceMetadata) -> OrchestrationStatus {
    match record.status {
        RuntimeStatus::Pending => OrchestrationStatus::Pending,
        RuntimeStatus::Running => OrchestrationStatus::Running,
        RuntimeStatus::Suspended => OrchestrationStatus::Suspended,
        RuntimeStatus::Completed => OrchestrationStatus::Completed {
            output: record.output.clone().unwrap_or_default(),
        },
        RuntimeStatus::Failed => OrchestrationStatus::Failed {
            details: record
                .failure
                .clone()
                .unwrap_or_else(|| crate::FailureDetail::new("UnknownError", "failure detail missing")),
        },
        RuntimeStatus::Terminated => OrchestrationStatus::Terminated {
            reason: record.output.clone().unwrap_or_default(),
        },
    }
}
