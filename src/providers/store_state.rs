use super::{
    ControlAdmission, CreateOutcome, InstanceFilter, InstanceMetadata, OrchestrationAck, OrchestrationItem,
    ProviderError, PurgeOutcome, WorkItem,
};
use crate::Event;
use crate::runtime::lifecycle::{apply_control, effective_status};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedMessage {
    seq: u64,
    item: WorkItem,
    visible_at_ms: u64,
    /// Lock token while the message is checked out. Locks are never persisted,
    /// so a reloaded store hands everything out again.
    #[serde(skip)]
    lock: Option<String>,
}

#[derive(Debug, Clone)]
struct InstanceLock {
    instance: String,
    execution_id: u64,
    locked_until_ms: u64,
    message_seqs: Vec<u64>,
}

#[derive(Debug, Clone)]
struct WorkLock {
    seq: u64,
    locked_until_ms: u64,
}

/// State shared by the in-memory and filesystem providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    instances: BTreeMap<String, InstanceMetadata>,
    histories: BTreeMap<String, Vec<Event>>,
    orchestrator_queue: Vec<QueuedMessage>,
    worker_queue: Vec<QueuedMessage>,
    next_seq: u64,
    #[serde(skip)]
    orchestration_locks: HashMap<String, InstanceLock>,
    #[serde(skip)]
    work_locks: HashMap<String, WorkLock>,
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn delay_ms(delay: Option<Duration>) -> u64 {
    delay.map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl StoreState {
    fn push(queue: &mut Vec<QueuedMessage>, next_seq: &mut u64, item: WorkItem, visible_at_ms: u64) {
        *next_seq += 1;
        queue.push(QueuedMessage {
            seq: *next_seq,
            item,
            visible_at_ms,
            lock: None,
        });
    }

    fn expire_locks(&mut self, now: u64) {
        let expired: Vec<String> = self
            .orchestration_locks
            .iter()
            .filter(|(_, l)| l.locked_until_ms <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(lock) = self.orchestration_locks.remove(&token) {
                debug!(instance = %lock.instance, "orchestration lock expired");
                for m in self.orchestrator_queue.iter_mut() {
                    if m.lock.as_deref() == Some(token.as_str()) {
                        m.lock = None;
                    }
                }
            }
        }

        let expired: Vec<String> = self
            .work_locks
            .iter()
            .filter(|(_, l)| l.locked_until_ms <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(lock) = self.work_locks.remove(&token)
                && let Some(m) = self.worker_queue.iter_mut().find(|m| m.seq == lock.seq)
            {
                m.lock = None;
            }
        }
    }

    pub(crate) fn read(&self, instance: &str) -> Vec<Event> {
        self.histories.get(instance).cloned().unwrap_or_default()
    }

    pub(crate) fn get_instance(&self, instance: &str) -> Option<InstanceMetadata> {
        self.instances.get(instance).cloned()
    }

    pub(crate) fn create_instance(
        &mut self,
        mut start: WorkItem,
        visible_at_ms: u64,
        replace_terminal: bool,
        now: u64,
    ) -> Result<CreateOutcome, ProviderError> {
        let instance = start.instance().to_string();
        if let Some(existing) = self.instances.get(&instance) {
            if !(replace_terminal && existing.status.is_terminal()) {
                return Ok(CreateOutcome::Exists {
                    status: existing.status,
                });
            }
            let next_execution = existing.execution_id + 1;
            if let WorkItem::StartOrchestration { execution_id, .. } = &mut start {
                *execution_id = next_execution;
            }
            self.histories.remove(&instance);
            self.orchestrator_queue
                .retain(|m| m.lock.is_some() || m.item.instance() != instance);
            self.worker_queue
                .retain(|m| m.lock.is_some() || m.item.instance() != instance);
        }

        let record = InstanceMetadata::pending(&start, now)
            .ok_or_else(|| ProviderError::permanent("create_instance", "expected a StartOrchestration item"))?;
        let execution_id = record.execution_id;
        self.instances.insert(instance, record);
        Self::push(&mut self.orchestrator_queue, &mut self.next_seq, start, visible_at_ms);
        Ok(CreateOutcome::Created { execution_id })
    }

    pub(crate) fn enqueue_orchestrator(&mut self, item: WorkItem, now: u64) {
        if matches!(item, WorkItem::StartOrchestration { .. })
            && !self.instances.contains_key(item.instance())
            && let Some(record) = InstanceMetadata::pending(&item, now)
        {
            self.instances.insert(record.instance_id.clone(), record);
        }
        Self::push(&mut self.orchestrator_queue, &mut self.next_seq, item, now);
    }

    pub(crate) fn enqueue_control(&mut self, item: WorkItem, now: u64) -> Result<ControlAdmission, ProviderError> {
        let op = item
            .control_op()
            .ok_or_else(|| ProviderError::permanent("enqueue_control", "not a control request"))?;
        let Some(record) = self.instances.get(item.instance()) else {
            return Ok(ControlAdmission::NotFound);
        };
        let queued = self
            .orchestrator_queue
            .iter()
            .filter(|m| m.item.instance() == record.instance_id)
            .filter_map(|m| m.item.control_op());
        let current = effective_status(record.status, queued);
        match apply_control(op, current) {
            Ok(_) => {
                Self::push(&mut self.orchestrator_queue, &mut self.next_seq, item, now);
                Ok(ControlAdmission::Accepted { previous: current })
            }
            Err(message) => Ok(ControlAdmission::Rejected { message }),
        }
    }

    pub(crate) fn fetch_orchestration(&mut self, now: u64, lock_timeout: Duration) -> Option<OrchestrationItem> {
        self.expire_locks(now);
        let locked: HashSet<&str> = self
            .orchestration_locks
            .values()
            .map(|l| l.instance.as_str())
            .collect();
        let instance = self
            .orchestrator_queue
            .iter()
            .find(|m| m.lock.is_none() && m.visible_at_ms <= now && !locked.contains(m.item.instance()))?
            .item
            .instance()
            .to_string();

        let token = new_token();
        let mut messages = Vec::new();
        let mut message_seqs = Vec::new();
        for m in self.orchestrator_queue.iter_mut() {
            if m.lock.is_none() && m.visible_at_ms <= now && m.item.instance() == instance {
                m.lock = Some(token.clone());
                messages.push(m.item.clone());
                message_seqs.push(m.seq);
            }
        }

        let metadata = self.instances.get(&instance).cloned();
        let execution_id = metadata
            .as_ref()
            .map(|r| r.execution_id)
            .unwrap_or(crate::INITIAL_EXECUTION_ID);
        self.orchestration_locks.insert(
            token.clone(),
            InstanceLock {
                instance: instance.clone(),
                execution_id,
                locked_until_ms: now + lock_timeout.as_millis() as u64,
                message_seqs,
            },
        );

        Some(OrchestrationItem {
            history: self.read(&instance),
            instance,
            execution_id,
            messages,
            metadata,
            lock_token: token,
        })
    }

    pub(crate) fn ack_orchestration(&mut self, token: &str, ack: OrchestrationAck, now: u64) -> Result<(), ProviderError> {
        let lock = self
            .orchestration_locks
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "lock token not found"))?;
        let seqs: HashSet<u64> = lock.message_seqs.iter().copied().collect();

        if lock.locked_until_ms <= now {
            for m in self.orchestrator_queue.iter_mut() {
                if seqs.contains(&m.seq) {
                    m.lock = None;
                }
            }
            return Err(ProviderError::permanent("ack_orchestration_item", "instance lock expired"));
        }

        self.orchestrator_queue.retain(|m| !seqs.contains(&m.seq));

        let current = self.instances.get(&lock.instance).map(|r| r.execution_id);
        if current != Some(lock.execution_id) {
            warn!(
                instance = %lock.instance,
                execution_id = lock.execution_id,
                "instance was purged or restarted during the pass, dropping results"
            );
            return Ok(());
        }

        self.histories
            .entry(lock.instance.clone())
            .or_default()
            .extend(ack.history_delta);
        for item in ack.worker_items {
            Self::push(&mut self.worker_queue, &mut self.next_seq, item, now);
        }
        for item in ack.timer_items {
            let visible_at_ms = match &item {
                WorkItem::TimerFired { fire_at_ms, .. } => *fire_at_ms,
                _ => now,
            };
            Self::push(&mut self.orchestrator_queue, &mut self.next_seq, item, visible_at_ms);
        }
        for item in ack.orchestrator_items {
            self.enqueue_orchestrator(item, now);
        }
        if let Some(projection) = &ack.projection
            && let Some(record) = self.instances.get_mut(&lock.instance)
        {
            record.apply_projection(projection, now);
            if projection.status.is_terminal() {
                // A delayed start must not outlive its instance
                self.orchestrator_queue.retain(|m| {
                    !(m.lock.is_none()
                        && m.item.instance() == lock.instance
                        && matches!(m.item, WorkItem::StartOrchestration { .. }))
                });
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn queued_orchestrator_items(&self, instance: &str) -> Vec<WorkItem> {
        self.orchestrator_queue
            .iter()
            .filter(|m| m.item.instance() == instance)
            .map(|m| m.item.clone())
            .collect()
    }

    pub(crate) fn abandon_orchestration(
        &mut self,
        token: &str,
        delay: Option<Duration>,
        now: u64,
    ) -> Result<(), ProviderError> {
        let lock = self
            .orchestration_locks
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "lock token not found"))?;
        let visible_at_ms = now + delay_ms(delay);
        for m in self.orchestrator_queue.iter_mut() {
            if lock.message_seqs.contains(&m.seq) {
                m.lock = None;
                m.visible_at_ms = m.visible_at_ms.max(visible_at_ms);
            }
        }
        Ok(())
    }

    pub(crate) fn fetch_work(&mut self, now: u64, lock_timeout: Duration) -> Option<(WorkItem, String)> {
        self.expire_locks(now);
        let m = self
            .worker_queue
            .iter_mut()
            .find(|m| m.lock.is_none() && m.visible_at_ms <= now)?;
        let token = new_token();
        m.lock = Some(token.clone());
        self.work_locks.insert(
            token.clone(),
            WorkLock {
                seq: m.seq,
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        );
        Some((m.item.clone(), token))
    }

    pub(crate) fn ack_work(&mut self, token: &str, completion: WorkItem, now: u64) -> Result<(), ProviderError> {
        let lock = self
            .work_locks
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_work_item", "lock token not found"))?;
        self.worker_queue.retain(|m| m.seq != lock.seq);
        if !self.instances.contains_key(completion.instance()) {
            debug!(instance = %completion.instance(), "dropping completion for purged instance");
            return Ok(());
        }
        self.enqueue_orchestrator(completion, now);
        Ok(())
    }

    pub(crate) fn abandon_work(&mut self, token: &str, delay: Option<Duration>, now: u64) -> Result<(), ProviderError> {
        let lock = self
            .work_locks
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("abandon_work_item", "lock token not found"))?;
        if let Some(m) = self.worker_queue.iter_mut().find(|m| m.seq == lock.seq) {
            m.lock = None;
            m.visible_at_ms = now + delay_ms(delay);
        }
        Ok(())
    }

    pub(crate) fn list_instances(&self, filter: &InstanceFilter) -> Vec<InstanceMetadata> {
        let mut out: Vec<_> = self.instances.values().filter(|r| filter.matches(r)).cloned().collect();
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        out
    }

    fn remove_instance(&mut self, instance: &str) {
        self.instances.remove(instance);
        self.histories.remove(instance);
        self.orchestrator_queue.retain(|m| m.item.instance() != instance);
        self.worker_queue.retain(|m| m.item.instance() != instance);
    }

    pub(crate) fn purge_instance(&mut self, instance: &str) -> PurgeOutcome {
        match self.instances.get(instance) {
            None => PurgeOutcome::NotFound,
            Some(r) if !r.status.is_terminal() => PurgeOutcome::NotTerminal { status: r.status },
            Some(_) => {
                self.remove_instance(instance);
                PurgeOutcome::Deleted
            }
        }
    }

    /// Delete terminal instances matching `filter`; non-terminal ones are never touched.
    pub(crate) fn purge_instances(&mut self, filter: &InstanceFilter) -> u64 {
        let doomed: Vec<String> = self
            .instances
            .values()
            .filter(|r| r.status.is_terminal() && filter.matches(r))
            .map(|r| r.instance_id.clone())
            .collect();
        for id in &doomed {
            self.remove_instance(id);
        }
        doomed.len() as u64
    }
}
