//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Fetches and executes activity work items
//! - Acknowledges each execution together with its completion

use crate::providers::WorkItem;
use crate::{ActivityContext, FailureDetail};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::super::{Runtime, registry};

impl Runtime {
    /// Start N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(
        self: Arc<Self>,
        activities: Arc<registry::ActivityRegistry>,
    ) -> Vec<JoinHandle<()>> {
        // Activities are independent work units that can run in parallel
        (0..self.options.worker_concurrency)
            .map(|worker_idx| {
                let rt = Arc::clone(&self);
                let activities = Arc::clone(&activities);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                tokio::spawn(async move {
                    while !rt.shutdown_flag.load(Ordering::Relaxed) {
                        let started = Instant::now();
                        match rt.history_store.fetch_work_item(rt.options.worker_lock_timeout).await {
                            Ok(Some((item, token))) => {
                                rt.execute_activity(&activities, item, &token, &worker_id).await;
                                continue;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(target: "durable_core::runtime", worker_id = %worker_id, error = %e, "error fetching work item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        }
                        let elapsed = started.elapsed();
                        let min_interval = rt.options.dispatcher_min_poll_interval;
                        if elapsed < min_interval {
                            tokio::time::sleep(min_interval - elapsed).await;
                        } else {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect()
    }

    async fn execute_activity(
        &self,
        activities: &registry::ActivityRegistry,
        item: WorkItem,
        token: &str,
        worker_id: &str,
    ) {
        let kind = item.kind_name();
        let WorkItem::ActivityExecute {
            instance,
            execution_id,
            orchestration,
            id,
            name,
            input,
        } = item
        else {
            error!(target: "durable_core::runtime", kind, "unexpected item in the worker queue, dropping");
            if let Err(e) = self.history_store.abandon_work_item(token, Some(Duration::from_secs(60))).await {
                warn!(target: "durable_core::runtime", error = %e, "abandon failed");
            }
            return;
        };

        tracing::debug!(
            target: "durable_core::runtime",
            instance_id = %instance,
            execution_id,
            activity_name = %name,
            activity_id = id,
            worker_id = %worker_id,
            "Activity started"
        );
        let start_time = Instant::now();

        let result = match activities.resolve_handler(&name) {
            Some((_, handler)) => {
                let ctx = ActivityContext::new(
                    instance.clone(),
                    execution_id,
                    orchestration,
                    name.clone(),
                    id,
                    worker_id.to_string(),
                );
                AssertUnwindSafe(handler.invoke(ctx, input))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "activity panicked".to_string());
                        Err(FailureDetail::new("ActivityPanicked", message))
                    })
            }
            None => Err(FailureDetail::configuration(
                "UnregisteredActivity",
                format!("activity '{name}' is not registered"),
            )),
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let completion = match result {
            Ok(result) => {
                tracing::debug!(
                    target: "durable_core::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    outcome = "success",
                    duration_ms,
                    result_size = result.len(),
                    "Activity completed"
                );
                WorkItem::ActivityCompleted {
                    instance: instance.clone(),
                    execution_id,
                    id,
                    result,
                }
            }
            Err(details) => {
                tracing::warn!(
                    target: "durable_core::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    category = ?details.category,
                    duration_ms,
                    error = %details,
                    "Activity failed"
                );
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    execution_id,
                    id,
                    details,
                }
            }
        };

        if let Err(e) = self.history_store.ack_work_item(token, completion).await {
            warn!(
                target: "durable_core::runtime",
                instance = %instance,
                execution_id,
                id,
                worker_id = %worker_id,
                error = %e,
                "worker: atomic ack failed"
            );
        }
    }
}
