//! Runtime: dispatchers that drive orchestration passes and activity execution
//! against a [`Provider`].
//!
//! The runtime keeps no state between passes. Every pass loads history and a
//! message batch from the provider, runs the orchestration once through the
//! [`ReplayEngine`](replay_engine::ReplayEngine), and commits the result with
//! a single acknowledgement.

use crate::providers::Provider;
use crate::{ActivityContext, FailureDetail, OrchestrationContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod correlation;
mod dispatchers;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod replay_engine;

pub use observability::{LogFormat, ObservabilityConfig};
pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of concurrent orchestration dispatcher tasks.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity worker tasks.
    pub worker_concurrency: usize,
    /// Minimum time between polls when a queue is empty.
    pub dispatcher_min_poll_interval: Duration,
    /// How long an instance stays locked while a pass runs.
    pub orchestrator_lock_timeout: Duration,
    /// How long an activity execution stays locked.
    pub worker_lock_timeout: Duration,
    /// Install a tracing subscriber on start. `None` leaves logging to the host.
    pub observability: Option<ObservabilityConfig>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            dispatcher_min_poll_interval: Duration::from_millis(10),
            orchestrator_lock_timeout: Duration::from_secs(5),
            worker_lock_timeout: Duration::from_secs(30),
            observability: None,
        }
    }
}

/// High-level orchestration status as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { details: FailureDetail },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, FailureDetail>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, FailureDetail>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, FailureDetail> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, FailureDetail>;
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, FailureDetail>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, FailureDetail> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime that executes orchestrations and activities and
/// persists their progress through a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    /// Short id distinguishing this runtime's dispatchers in logs.
    runtime_id: String,
}

impl Runtime {
    /// Start a new runtime with a custom `Provider` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if let Some(config) = &options.observability
            && let Err(e) = observability::init_logging(config)
        {
            debug!(target: "durable_core::runtime", error = %e, "logging already initialized");
        }

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let orchestration = Arc::clone(&runtime).start_orchestration_dispatcher();
        let work = Arc::clone(&runtime).start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.extend(orchestration.into_iter().chain(work));

        debug!(
            target: "durable_core::runtime",
            runtime_id = %runtime.runtime_id,
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            "runtime started"
        );
        runtime
    }

    pub fn orchestration_registry(&self) -> &OrchestrationRegistry {
        &self.orchestration_registry
    }

    /// Stop the dispatchers. With a timeout, in-flight passes and activities
    /// get that long to finish before their tasks are aborted; anything not
    /// acknowledged is redelivered when its lock expires.
    pub async fn shutdown(self: Arc<Self>, timeout: Option<Duration>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        if let Some(timeout) = timeout {
            let deadline = tokio::time::Instant::now() + timeout;
            for j in joins.iter_mut() {
                if tokio::time::timeout_at(deadline, j).await.is_err() {
                    warn!(target: "durable_core::runtime", "dispatcher did not stop before the shutdown timeout");
                    break;
                }
            }
        }
        for j in joins.drain(..) {
            j.abort();
        }
        debug!(target: "durable_core::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }
}
