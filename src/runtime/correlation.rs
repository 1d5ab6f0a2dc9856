//! Correlation of scheduled operations with the history events that resolve them.
//!
//! Every schedule call registers an operation and receives a sequence number,
//! which is the `event_id` of its scheduling event. Completions carry that
//! number back (`source_event_id`), so results are matched by id and never by
//! arrival order. External events are the exception: they are matched by name,
//! the k-th wait on a name receiving the k-th event raised with that name.

use crate::DurableOutput;
use std::collections::{BTreeMap, HashMap};

/// An operation registered by orchestration code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledOp {
    Activity {
        name: String,
        input: String,
    },
    Timer {
        fire_at_ms: u64,
    },
    External {
        name: String,
    },
    SubOrchestration {
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
}

impl ScheduledOp {
    /// Whether a replayed schedule call reproduces a recorded one.
    ///
    /// Timer fire times depend on the clock when first scheduled and sub-orchestration
    /// instance ids from the sequence number, so neither takes part.
    fn matches(&self, recorded: &ScheduledOp) -> bool {
        match (self, recorded) {
            (ScheduledOp::Activity { name: a, input: ai }, ScheduledOp::Activity { name: b, input: bi }) => {
                a == b && ai == bi
            }
            (ScheduledOp::Timer { .. }, ScheduledOp::Timer { .. }) => true,
            (ScheduledOp::External { name: a }, ScheduledOp::External { name: b }) => a == b,
            (
                ScheduledOp::SubOrchestration { name: a, input: ai, .. },
                ScheduledOp::SubOrchestration { name: b, input: bi, .. },
            ) => a == b && ai == bi,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            ScheduledOp::Activity { name, input } => format!("ActivityScheduled('{name}','{input}')"),
            ScheduledOp::Timer { .. } => "TimerCreated".to_string(),
            ScheduledOp::External { name } => format!("ExternalSubscribed('{name}')"),
            ScheduledOp::SubOrchestration { name, input, .. } => {
                format!("SubOrchestrationScheduled('{name}','{input}')")
            }
        }
    }

    fn accepts(&self, output: &DurableOutput) -> bool {
        matches!(
            (self, output),
            (ScheduledOp::Activity { .. }, DurableOutput::Activity(_))
                | (ScheduledOp::Timer { .. }, DurableOutput::Timer)
                | (ScheduledOp::External { .. }, DurableOutput::External(_))
                | (ScheduledOp::SubOrchestration { .. }, DurableOutput::SubOrchestration(_))
        )
    }
}

/// A resolution together with the position of its resolving event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub output: DurableOutput,
}

/// Outcome of registering an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The operation reproduces a scheduling event already in history.
    Replayed(u64),
    /// The operation is new; the caller must record its scheduling event.
    New(u64),
}

#[derive(Debug)]
struct Entry {
    op: ScheduledOp,
    resolution: Option<Resolved>,
}

#[derive(Debug)]
pub struct CorrelationTable {
    entries: BTreeMap<u64, Entry>,
    /// Recorded scheduling events in history order.
    recorded: Vec<u64>,
    /// Index of the next recorded scheduling event to be claimed.
    cursor: usize,
    next_seq: u64,
    waits_by_name: HashMap<String, Vec<u64>>,
    events_by_name: HashMap<String, Vec<Resolved>>,
}

impl CorrelationTable {
    /// An empty table whose new registrations start at `next_seq`.
    pub fn new(next_seq: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            recorded: Vec::new(),
            cursor: 0,
            next_seq,
            waits_by_name: HashMap::new(),
            events_by_name: HashMap::new(),
        }
    }

    /// Load a scheduling event found in history.
    pub fn register_recorded(&mut self, seq: u64, op: ScheduledOp) {
        if let ScheduledOp::External { name } = &op {
            self.waits_by_name.entry(name.clone()).or_default().push(seq);
        }
        self.entries.insert(seq, Entry { op, resolution: None });
        self.recorded.push(seq);
        self.next_seq = self.next_seq.max(seq + 1);
    }

    /// Register an operation issued by orchestration code.
    ///
    /// While recorded scheduling events remain unclaimed, the operation must
    /// reproduce the next one; otherwise the error describes the divergence.
    pub fn register(&mut self, op: ScheduledOp) -> Result<Claim, String> {
        if let Some(&seq) = self.recorded.get(self.cursor) {
            let recorded = &self.entries[&seq].op;
            if !op.matches(recorded) {
                return Err(format!(
                    "nondeterministic: schedule order mismatch: next is {} but expected {}",
                    recorded.describe(),
                    op.describe()
                ));
            }
            self.cursor += 1;
            return Ok(Claim::Replayed(seq));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if let ScheduledOp::External { name } = &op {
            self.waits_by_name.entry(name.clone()).or_default().push(seq);
        }
        self.entries.insert(seq, Entry { op, resolution: None });
        Ok(Claim::New(seq))
    }

    pub(crate) fn set_sub_orchestration_instance(&mut self, seq: u64, child: String) {
        if let Some(Entry {
            op: ScheduledOp::SubOrchestration { instance, .. },
            ..
        }) = self.entries.get_mut(&seq)
        {
            *instance = child;
        }
    }

    /// Resolve a registered operation. Unknown ids, kind mismatches and repeated
    /// resolutions are ignored; returns whether the resolution was taken.
    pub fn resolve(&mut self, seq: u64, resolved: Resolved) -> bool {
        let Some(entry) = self.entries.get_mut(&seq) else {
            tracing::debug!(target: "durable_core::orchestration", seq, "resolution for unknown operation ignored");
            return false;
        };
        if entry.resolution.is_some() || !entry.op.accepts(&resolved.output) {
            return false;
        }
        entry.resolution = Some(resolved);
        true
    }

    /// Buffer an external event raised with `name`.
    pub fn deliver_external(&mut self, name: &str, resolved: Resolved) {
        self.events_by_name.entry(name.to_string()).or_default().push(resolved);
    }

    /// Current resolution of an operation, if any.
    pub fn resolution(&self, seq: u64) -> Option<Resolved> {
        let entry = self.entries.get(&seq)?;
        if let ScheduledOp::External { name } = &entry.op {
            let k = self.waits_by_name.get(name)?.iter().position(|s| *s == seq)?;
            return self.events_by_name.get(name)?.get(k).cloned();
        }
        entry.resolution.clone()
    }

    /// Registered operations without a resolution, in sequence order.
    pub fn outstanding(&self) -> Vec<u64> {
        self.entries
            .keys()
            .copied()
            .filter(|seq| self.resolution(*seq).is_none())
            .collect()
    }

    /// Recorded scheduling events not yet claimed by orchestration code.
    pub fn unclaimed(&self) -> usize {
        self.recorded.len() - self.cursor
    }

    pub fn is_replaying(&self) -> bool {
        self.cursor < self.recorded.len()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod correlation_tests;
