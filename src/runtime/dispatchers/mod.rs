//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: runs orchestration passes over locked instance batches
//! - `worker`: executes activities

mod orchestration;
mod worker;
