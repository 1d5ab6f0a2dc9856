//! Replay Engine Tests
//!
//! Tests for the ReplayEngine, verifying history-action matching,
//! completion processing, lifecycle control and determinism enforcement.

mod helpers;

mod completion_messages;
mod composition;
mod fresh_execution;
mod replay_with_completions;
