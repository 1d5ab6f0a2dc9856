use std::time::Duration;
use tokio::sync::Mutex;

use super::store_state::StoreState;
use super::{
    ControlAdmission, CreateOutcome, InstanceFilter, InstanceMetadata, ManagementProvider, OrchestrationAck,
    OrchestrationItem, Provider, ProviderError, PurgeOutcome, WorkItem,
};
use crate::{Event, now_ms};

/// Volatile provider for tests and embedded use.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<StoreState>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.state.lock().await.read(instance))
    }

    async fn create_instance(
        &self,
        start: WorkItem,
        visible_at_ms: u64,
        replace_terminal: bool,
    ) -> Result<CreateOutcome, ProviderError> {
        self.state
            .lock()
            .await
            .create_instance(start, visible_at_ms, replace_terminal, now_ms())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        self.state.lock().await.enqueue_orchestrator(item, now_ms());
        Ok(())
    }

    async fn enqueue_control(&self, item: WorkItem) -> Result<ControlAdmission, ProviderError> {
        self.state.lock().await.enqueue_control(item, now_ms())
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        Ok(self.state.lock().await.fetch_orchestration(now_ms(), lock_timeout))
    }

    async fn ack_orchestration_item(&self, lock_token: &str, ack: OrchestrationAck) -> Result<(), ProviderError> {
        self.state.lock().await.ack_orchestration(lock_token, ack, now_ms())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        self.state.lock().await.abandon_orchestration(lock_token, delay, now_ms())
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        Ok(self.state.lock().await.fetch_work(now_ms(), lock_timeout))
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        self.state.lock().await.ack_work(token, completion, now_ms())
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.state.lock().await.abandon_work(token, delay, now_ms())
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceMetadata>, ProviderError> {
        Ok(self.state.lock().await.get_instance(instance))
    }

    fn as_management(&self) -> Option<&dyn ManagementProvider> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ManagementProvider for InMemoryProvider {
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceMetadata>, ProviderError> {
        Ok(self.state.lock().await.list_instances(filter))
    }

    async fn purge_instance(&self, instance: &str) -> Result<PurgeOutcome, ProviderError> {
        Ok(self.state.lock().await.purge_instance(instance))
    }

    async fn purge_instances(&self, filter: &InstanceFilter) -> Result<u64, ProviderError> {
        Ok(self.state.lock().await.purge_instances(filter))
    }
}
