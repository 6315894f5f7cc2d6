//! In-memory state store for the Conveyor process engine.
//!
//! Implements the repository traits from `conveyor-core` over shared
//! `RwLock`-protected maps. Useful for development, tests, and small
//! single-node deployments where durability across restarts is not
//! required; everything is lost when the process exits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod repositories;
pub use repositories::{
    InMemoryCorrelationRepository, InMemoryDefinitionRepository, InMemoryInstanceRepository,
    InMemoryTaskRepository, InMemoryTimerRepository,
};

use conveyor_core::domain::repository::Repositories;
use conveyor_core::{ProcessDefinition, ProcessInstance, Task, TimerSubscription};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[cfg(test)]
mod tests;

/// Owns the shared maps and hands out repository views over them.
///
/// All repositories created by one provider see the same state, so a
/// runtime and a test can inspect each other's writes.
pub struct InMemoryStateStore {
    definitions: Arc<RwLock<HashMap<(String, u32), ProcessDefinition>>>,
    instances: Arc<RwLock<HashMap<String, ProcessInstance>>>,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    timers: Arc<RwLock<HashMap<String, TimerSubscription>>>,
    waits: Arc<RwLock<HashMap<(String, String), Vec<conveyor_core::EventWait>>>>,
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            timers: Arc::new(RwLock::new(HashMap::new())),
            waits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build the repository set the runtime is constructed with
    pub fn repositories(&self) -> Repositories {
        Repositories {
            definitions: Arc::new(InMemoryDefinitionRepository::new(self.definitions.clone())),
            instances: Arc::new(InMemoryInstanceRepository::new(self.instances.clone())),
            tasks: Arc::new(InMemoryTaskRepository::new(self.tasks.clone())),
            timers: Arc::new(InMemoryTimerRepository::new(self.timers.clone())),
            correlations: Arc::new(InMemoryCorrelationRepository::new(self.waits.clone())),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}
