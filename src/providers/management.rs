//! Administrative provider interface.
//!
//! Separate from [`Provider`](super::Provider) so the runtime hot path and
//! admin operations (queries, purges) can evolve independently. Reached
//! through [`Provider::as_management`](super::Provider::as_management).

use super::{InstanceFilter, InstanceMetadata, ProviderError, PurgeOutcome};

#[async_trait::async_trait]
pub trait ManagementProvider: Send + Sync {
    /// Instance records matching `filter`, oldest first. Read-only.
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceMetadata>, ProviderError>;

    /// Delete one terminal instance with its history and queued messages.
    async fn purge_instance(&self, instance: &str) -> Result<PurgeOutcome, ProviderError>;

    /// Delete every terminal instance matching `filter`; returns how many went.
    ///
    /// Instances that are not Completed, Failed or Terminated are never
    /// deleted, whatever the filter says.
    async fn purge_instances(&self, filter: &InstanceFilter) -> Result<u64, ProviderError>;
}
