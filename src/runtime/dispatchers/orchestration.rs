//! Orchestration dispatcher implementation for Runtime
//!
//! This module contains the orchestration dispatcher logic that:
//! - Spawns concurrent orchestration workers
//! - Fetches locked instance batches and runs one pass per batch
//! - Commits each pass with a single acknowledgement

use crate::providers::{OrchestrationAck, OrchestrationItem, WorkItem};
use crate::runtime::lifecycle::{RuntimeStatus, project_history};
use crate::runtime::replay_engine::{ReplayEngine, StartRequest, TurnResult};
use crate::{Action, Event, EventKind, FailureDetail, INITIAL_EXECUTION_ID, now_ms};
use semver::Version;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::Runtime;

/// Parent link recorded in a child's start event.
struct ParentLink {
    instance: String,
    execution_id: u64,
    id: u64,
}

impl Runtime {
    /// Start N concurrent orchestration dispatcher tasks
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        // Instance-level locking in the provider prevents concurrent passes for one instance
        (0..self.options.orchestration_concurrency)
            .map(|worker_idx| {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                tokio::spawn(async move {
                    while !rt.shutdown_flag.load(Ordering::Relaxed) {
                        let started = Instant::now();
                        match rt
                            .history_store
                            .fetch_orchestration_item(rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some(item)) => {
                                rt.process_orchestration_item(item, &worker_id).await;
                                continue;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(target: "durable_core::runtime", worker_id = %worker_id, error = %e, "error fetching orchestration item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        }
                        // Enforce minimum polling interval to prevent hot loops
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

    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem, worker_id: &str) {
        let OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            metadata,
            lock_token,
        } = item;

        let mut start = messages.iter().find_map(|m| match m {
            WorkItem::StartOrchestration {
                orchestration,
                version,
                input,
                parent_instance,
                parent_id,
                parent_execution_id,
                scheduled_start_ms,
                tags,
                ..
            } => Some((
                orchestration.clone(),
                version.clone(),
                StartRequest {
                    name: orchestration.clone(),
                    version: String::new(),
                    input: input.clone(),
                    parent_instance: parent_instance.clone(),
                    parent_id: *parent_id,
                    parent_execution_id: *parent_execution_id,
                    scheduled_start_ms: *scheduled_start_ms,
                    tags: tags.clone(),
                },
            )),
            _ => None,
        });

        let terminating = messages
            .iter()
            .any(|m| matches!(m, WorkItem::TerminateInstance { .. }));
        if history.is_empty() && start.is_none() {
            match metadata {
                // A terminate does not wait for a scheduled start: start from
                // the stored record so the pass records the termination
                Some(record) if record.status == RuntimeStatus::Pending && terminating => {
                    debug!(target: "durable_core::runtime", instance = %instance, "terminating instance before its scheduled start");
                    start = Some((
                        record.name.clone(),
                        record.version.clone(),
                        StartRequest {
                            name: record.name,
                            version: String::new(),
                            input: record.input,
                            parent_instance: record.parent_instance,
                            parent_id: None,
                            parent_execution_id: None,
                            scheduled_start_ms: record.scheduled_start_ms,
                            tags: record.tags,
                        },
                    ));
                }
                Some(record) if record.status == RuntimeStatus::Pending => {
                    // Messages for an instance whose start is not yet visible
                    let until_start = record
                        .scheduled_start_ms
                        .map(|at| Duration::from_millis(at.saturating_sub(now_ms())))
                        .unwrap_or_default();
                    let delay = until_start.max(self.options.dispatcher_min_poll_interval);
                    debug!(target: "durable_core::runtime", instance = %instance, delay_ms = delay.as_millis() as u64, "instance not started yet, deferring messages");
                    if let Err(e) = self.history_store.abandon_orchestration_item(&lock_token, Some(delay)).await {
                        warn!(target: "durable_core::runtime", instance = %instance, error = %e, "abandon failed");
                    }
                }
                _ => {
                    warn!(target: "durable_core::runtime", instance = %instance, count = messages.len(), "dropping messages for unknown instance");
                    self.ack(&instance, &lock_token, OrchestrationAck::default()).await;
                }
            }
            if start.is_none() {
                return;
            }
        }

        let mut engine = ReplayEngine::new(instance.clone(), execution_id, history);

        // Resolve the handler: pinned by the start event, or chosen now for a new instance
        let started = engine.final_history().into_iter().find_map(|e| match e.kind {
            EventKind::OrchestrationStarted {
                name,
                version,
                input,
                parent_instance,
                parent_id,
                parent_execution_id,
                ..
            } => Some((name, version, input, parent_instance, parent_id, parent_execution_id)),
            _ => None,
        });
        let (name, input, parent, handler) = match (started, start) {
            (Some((name, version, input, parent_instance, parent_id, parent_execution_id)), _) => {
                let handler = Version::parse(&version)
                    .ok()
                    .and_then(|v| self.orchestration_registry.resolve_handler_exact(&name, &v));
                let parent = parent_link(parent_instance, parent_id, parent_execution_id);
                (name, input, parent, handler.ok_or(version))
            }
            (None, Some((name, requested, mut request))) => {
                let resolved = match &requested {
                    Some(v) => Version::parse(v).ok().and_then(|parsed| {
                        self.orchestration_registry
                            .resolve_handler_exact(&name, &parsed)
                            .map(|h| (parsed, h))
                    }),
                    None => self.orchestration_registry.resolve_handler(&name),
                };
                let (version, handler) = match resolved {
                    Some((v, h)) => (v.to_string(), Ok(h)),
                    None => {
                        let v = requested.unwrap_or_else(|| "0.0.0".to_string());
                        (v.clone(), Err(v))
                    }
                };
                request.version = version;
                let input = request.input.clone();
                let parent = parent_link(
                    request.parent_instance.clone(),
                    request.parent_id,
                    request.parent_execution_id,
                );
                engine.start(request);
                (name, input, parent, handler)
            }
            (None, None) => {
                warn!(target: "durable_core::runtime", instance = %instance, "history without a start event");
                self.ack(&instance, &lock_token, OrchestrationAck::default()).await;
                return;
            }
        };

        engine.prep_completions(messages);

        let turn = match handler {
            Ok(handler) => engine.execute_orchestration(handler, input),
            Err(version) => {
                warn!(target: "durable_core::runtime", instance = %instance, orchestration = %name, %version, "orchestration not registered");
                engine.fail_without_running(FailureDetail::configuration(
                    "UnregisteredOrchestration",
                    format!("orchestration '{name}' version {version} is not registered"),
                ))
            }
        };

        debug!(
            target: "durable_core::runtime",
            instance_id = %instance,
            execution_id,
            orchestration_name = %name,
            worker_id = %worker_id,
            turn = ?turn,
            new_events = engine.history_delta().len(),
            actions = engine.pending_actions().len(),
            "orchestration pass finished"
        );

        let ack = self.build_ack(&engine, &instance, execution_id, &name, parent.as_ref(), &turn);
        self.ack(&instance, &lock_token, ack).await;
    }

    fn build_ack(
        &self,
        engine: &ReplayEngine,
        instance: &str,
        execution_id: u64,
        orchestration: &str,
        parent: Option<&ParentLink>,
        turn: &TurnResult,
    ) -> OrchestrationAck {
        let mut ack = OrchestrationAck {
            history_delta: engine.history_delta().to_vec(),
            ..Default::default()
        };

        for action in engine.pending_actions() {
            match action.clone() {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                } => ack.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id,
                    orchestration: orchestration.to_string(),
                    id: scheduling_event_id,
                    name,
                    input,
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => ack.timer_items.push(WorkItem::TimerFired {
                    instance: instance.to_string(),
                    execution_id,
                    id: scheduling_event_id,
                    fire_at_ms,
                }),
                // The subscription event is all a wait needs
                Action::WaitExternal { .. } => {}
                Action::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    version,
                    instance: child,
                    input,
                } => ack.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    version,
                    input,
                    execution_id: INITIAL_EXECUTION_ID,
                    parent_instance: Some(instance.to_string()),
                    parent_id: Some(scheduling_event_id),
                    parent_execution_id: Some(execution_id),
                    scheduled_start_ms: None,
                    tags: BTreeMap::new(),
                }),
            }
        }

        if let Some(parent) = parent {
            let notify = match turn {
                TurnResult::Completed(output) => Some(WorkItem::SubOrchCompleted {
                    parent_instance: parent.instance.clone(),
                    parent_execution_id: parent.execution_id,
                    parent_id: parent.id,
                    result: output.clone(),
                }),
                TurnResult::Failed(details) => Some(WorkItem::SubOrchFailed {
                    parent_instance: parent.instance.clone(),
                    parent_execution_id: parent.execution_id,
                    parent_id: parent.id,
                    details: details.clone(),
                }),
                TurnResult::Terminated(reason) => Some(WorkItem::SubOrchFailed {
                    parent_instance: parent.instance.clone(),
                    parent_execution_id: parent.execution_id,
                    parent_id: parent.id,
                    details: FailureDetail::new("OrchestrationTerminated", reason.clone()),
                }),
                _ => None,
            };
            ack.orchestrator_items.extend(notify);
        }

        if let TurnResult::Terminated(reason) = turn {
            for child in running_children(&engine.final_history()) {
                debug!(target: "durable_core::runtime", instance = %instance, child = %child, "terminating sub-orchestration");
                ack.orchestrator_items.push(WorkItem::TerminateInstance {
                    instance: child,
                    reason: reason.clone(),
                });
            }
        }

        ack.projection = project_history(&engine.final_history());
        ack
    }

    async fn ack(&self, instance: &str, lock_token: &str, ack: OrchestrationAck) {
        if let Err(e) = self.history_store.ack_orchestration_item(lock_token, ack).await {
            // The lock is gone; the batch is redelivered and the pass rerun
            warn!(target: "durable_core::runtime", instance = %instance, error = %e, "orchestration ack failed");
        }
    }
}

fn parent_link(instance: Option<String>, id: Option<u64>, execution_id: Option<u64>) -> Option<ParentLink> {
    Some(ParentLink {
        instance: instance?,
        id: id?,
        execution_id: execution_id.unwrap_or(INITIAL_EXECUTION_ID),
    })
}

/// Sub-orchestrations scheduled in `history` that have not reported back.
fn running_children(history: &[Event]) -> Vec<String> {
    let finished: HashSet<u64> = history
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::SubOrchestrationCompleted { .. } | EventKind::SubOrchestrationFailed { .. }
            )
        })
        .filter_map(|e| e.source_event_id)
        .collect();
    history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::SubOrchestrationScheduled { instance, .. } if !finished.contains(&e.event_id) => {
                Some(instance.clone())
            }
            _ => None,
        })
        .collect()
}
