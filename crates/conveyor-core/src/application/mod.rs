//! Application services: definition publishing, signal execution, the
//! per-instance dispatcher, the timer and event bus, and the runtime
//! facade hosts embed.

pub mod definition_service;
pub mod dispatcher;
pub mod event_bus;
pub mod execution;
pub mod runtime;
pub mod task_ledger;

use std::time::Duration;

/// Tuning knobs for the engine.
///
/// Defaults suit tests and small deployments; hosts override fields as
/// needed before constructing the runtime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the timer scan loop polls for due subscriptions
    pub timer_scan_interval: Duration,

    /// How long an unmatched external event is retried before being dropped
    pub event_replay_window: Duration,

    /// How many optimistic save conflicts to absorb before giving up on
    /// a signal
    pub conflict_retry_limit: u32,

    /// Total attempts (first try included) for an automatic step's
    /// collaborator call
    pub automatic_attempts: u32,

    /// Base delay of the exponential backoff between automatic attempts
    pub automatic_retry_base: Duration,

    /// Capacity of each per-instance signal lane
    pub lane_buffer: usize,

    /// Upper bound on steps advanced per signal, halting runaway loops
    pub max_steps_per_signal: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer_scan_interval: Duration::from_millis(50),
            event_replay_window: Duration::from_secs(30),
            conflict_retry_limit: 16,
            automatic_attempts: 5,
            automatic_retry_base: Duration::from_millis(50),
            lane_buffer: 64,
            max_steps_per_signal: 1000,
        }
    }
}
