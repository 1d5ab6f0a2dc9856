#![allow(dead_code)]

use durable_core::providers::Provider;
use durable_core::providers::fs::FsProvider;
use durable_core::providers::in_memory::InMemoryProvider;
use durable_core::{Client, Event, EventKind, OrchestrationStatus};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_subscription(store: StdArc<dyn Provider>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(&e.kind, EventKind::ExternalSubscribed { name: n } if n == name))
        },
        timeout_ms,
    )
    .await
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn Provider>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    T: Clone,
    F: Fn(&Vec<Event>) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if let Some(e) = selector(&hist) {
            return Some(e);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Number of events of the given kind in `hist`.
pub fn count_kind(hist: &[Event], kind: &str) -> usize {
    hist.iter().filter(|e| e.kind_name() == kind).count()
}

pub fn create_memory_store() -> StdArc<dyn Provider> {
    StdArc::new(InMemoryProvider::new()) as StdArc<dyn Provider>
}

pub fn create_fs_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsProvider::new(td.path(), true).unwrap()) as StdArc<dyn Provider>;
    (store, td)
}

/// Poll the instance status until `predicate` holds.
pub async fn wait_for_status<F>(client: &Client, instance: &str, predicate: F, timeout_ms: u64) -> Option<OrchestrationStatus>
where
    F: Fn(&OrchestrationStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let status = client.get_orchestration_status(instance).await.ok()?;
        if predicate(&status) {
            return Some(status);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
