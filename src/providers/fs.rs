use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::fs;

use super::store_state::StoreState;
use super::{
    ControlAdmission, CreateOutcome, InstanceFilter, InstanceMetadata, ManagementProvider, OrchestrationAck,
    OrchestrationItem, Provider, ProviderError, PurgeOutcome, WorkItem,
};
use crate::{Event, now_ms};

const SNAPSHOT: &str = "store.json";

/// Filesystem-backed provider for local development.
///
/// All state lives in one JSON snapshot under `root`, rewritten after every
/// mutation (write to a temp file, then rename). A mutation is staged on a copy
/// of the state and only becomes visible once its snapshot is written, so a
/// failed write leaves the store as it was. Queue locks are kept in memory
/// only, so a provider reopened after a crash redelivers every message that
/// was checked out but never acknowledged.
pub struct FsProvider {
    root: PathBuf,
    state: Mutex<StoreState>,
}

impl FsProvider {
    /// Open (or create) a store rooted at `root`. With `reset_on_create`, any
    /// existing data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, ProviderError> {
        let root = root.as_ref().to_path_buf();
        if reset_on_create && root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;
        let snapshot = root.join(SNAPSHOT);
        let state = if snapshot.exists() {
            let raw = std::fs::read_to_string(&snapshot)?;
            serde_json::from_str(&raw)?
        } else {
            StoreState::default()
        };
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn persist(&self, state: &StoreState) -> Result<(), ProviderError> {
        let raw = serde_json::to_vec(state)?;
        let tmp = self.root.join(format!("{SNAPSHOT}.tmp"));
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, self.root.join(SNAPSHOT)).await?;
        Ok(())
    }

    /// Run `change` against a copy of the state. The copy replaces the live
    /// state after it is persisted, or without persisting when `dirty` says
    /// nothing durable changed.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut StoreState) -> Result<T, ProviderError>,
        dirty: impl FnOnce(&T) -> bool,
    ) -> Result<T, ProviderError> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let out = change(&mut staged)?;
        if dirty(&out) {
            self.persist(&staged).await?;
        }
        *state = staged;
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.state.lock().await.read(instance))
    }

    async fn create_instance(
        &self,
        start: WorkItem,
        visible_at_ms: u64,
        replace_terminal: bool,
    ) -> Result<CreateOutcome, ProviderError> {
        self.commit(
            |state| state.create_instance(start, visible_at_ms, replace_terminal, now_ms()),
            |outcome| matches!(outcome, CreateOutcome::Created { .. }),
        )
        .await
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        self.commit(
            |state| {
                state.enqueue_orchestrator(item, now_ms());
                Ok(())
            },
            |_| true,
        )
        .await
    }

    async fn enqueue_control(&self, item: WorkItem) -> Result<ControlAdmission, ProviderError> {
        self.commit(
            |state| state.enqueue_control(item, now_ms()),
            |admission| matches!(admission, ControlAdmission::Accepted { .. }),
        )
        .await
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        Ok(self.state.lock().await.fetch_orchestration(now_ms(), lock_timeout))
    }

    async fn ack_orchestration_item(&self, lock_token: &str, ack: OrchestrationAck) -> Result<(), ProviderError> {
        self.commit(|state| state.ack_orchestration(lock_token, ack, now_ms()), |_| true)
            .await
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        self.commit(|state| state.abandon_orchestration(lock_token, delay, now_ms()), |_| true)
            .await
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        Ok(self.state.lock().await.fetch_work(now_ms(), lock_timeout))
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        self.commit(|state| state.ack_work(token, completion, now_ms()), |_| true)
            .await
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.commit(|state| state.abandon_work(token, delay, now_ms()), |_| true)
            .await
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceMetadata>, ProviderError> {
        Ok(self.state.lock().await.get_instance(instance))
    }

    fn as_management(&self) -> Option<&dyn ManagementProvider> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ManagementProvider for FsProvider {
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceMetadata>, ProviderError> {
        Ok(self.state.lock().await.list_instances(filter))
    }

    async fn purge_instance(&self, instance: &str) -> Result<PurgeOutcome, ProviderError> {
        self.commit(
            |state| Ok(state.purge_instance(instance)),
            |outcome| *outcome == PurgeOutcome::Deleted,
        )
        .await
    }

    async fn purge_instances(&self, filter: &InstanceFilter) -> Result<u64, ProviderError> {
        self.commit(|state| Ok(state.purge_instances(filter)), |deleted| *deleted > 0)
            .await
    }
}
