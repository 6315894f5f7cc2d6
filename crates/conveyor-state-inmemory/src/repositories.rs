//! Repository implementations over shared `RwLock`-protected maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::repository::{
    CorrelationRepository, DefinitionRepository, EventWait, InstanceRepository, TaskRepository,
    TimerRepository,
};
use conveyor_core::{
    DefinitionName, DefinitionRef, EngineError, InstanceId, InstanceStatus, PositionToken,
    ProcessDefinition, ProcessInstance, Task, TaskId, TaskStatus, TimerId, TimerStatus,
    TimerSubscription,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Definition store keyed by `(name, version)`
pub struct InMemoryDefinitionRepository {
    definitions: Arc<RwLock<HashMap<(String, u32), ProcessDefinition>>>,
}

impl InMemoryDefinitionRepository {
    /// Create a repository over a shared map
    pub fn new(definitions: Arc<RwLock<HashMap<(String, u32), ProcessDefinition>>>) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn save(&self, definition: &ProcessDefinition) -> Result<(), EngineError> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(
            (definition.name.0.clone(), definition.version),
            definition.clone(),
        );
        debug!(definition = %definition.name, version = definition.version, "saved definition");
        Ok(())
    }

    async fn find(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .get(&(reference.name.0.clone(), reference.version))
            .cloned())
    }

    async fn find_active(
        &self,
        name: &DefinitionName,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .filter(|d| d.name == *name && d.active)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_versions(
        &self,
        name: &DefinitionName,
    ) -> Result<Vec<ProcessDefinition>, EngineError> {
        let definitions = self.definitions.read().await;
        let mut versions: Vec<ProcessDefinition> = definitions
            .values()
            .filter(|d| d.name == *name)
            .cloned()
            .collect();
        versions.sort_by_key(|d| d.version);
        Ok(versions)
    }

    async fn list_names(&self) -> Result<Vec<DefinitionName>, EngineError> {
        let definitions = self.definitions.read().await;
        let mut names: Vec<String> = definitions.keys().map(|(name, _)| name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names.into_iter().map(DefinitionName).collect())
    }
}

/// Instance store with compare-and-swap on the revision counter
pub struct InMemoryInstanceRepository {
    instances: Arc<RwLock<HashMap<String, ProcessInstance>>>,
}

impl InMemoryInstanceRepository {
    /// Create a repository over a shared map
    pub fn new(instances: Arc<RwLock<HashMap<String, ProcessInstance>>>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn save(&self, instance: &ProcessInstance) -> Result<u64, EngineError> {
        let mut instances = self.instances.write().await;
        if let Some(stored) = instances.get(&instance.id.0) {
            if stored.revision != instance.revision {
                return Err(EngineError::ConcurrencyConflict(format!(
                    "instance {} is at revision {}, save expected {}",
                    instance.id, stored.revision, instance.revision
                )));
            }
        }
        let mut saved = instance.clone();
        saved.revision += 1;
        let revision = saved.revision;
        instances.insert(instance.id.0.clone(), saved);
        Ok(revision)
    }

    async fn find(&self, id: &InstanceId) -> Result<Option<ProcessInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_definition(
        &self,
        name: &DefinitionName,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.definition.name == *name)
            .cloned()
            .collect())
    }
}

/// Task ledger store
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    /// Create a repository over a shared map
    pub fn new(tasks: Arc<RwLock<HashMap<String, Task>>>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &Task) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.0.clone(), task.clone());
        Ok(())
    }

    async fn find(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id.0).cloned())
    }

    async fn list_for_instance(&self, instance_id: &InstanceId) -> Result<Vec<Task>, EngineError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.instance_id == *instance_id)
            .cloned()
            .collect())
    }

    async fn list_open_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, EngineError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.assignee == assignee && t.status == TaskStatus::Open)
            .cloned()
            .collect())
    }
}

/// Timer subscription store
pub struct InMemoryTimerRepository {
    timers: Arc<RwLock<HashMap<String, TimerSubscription>>>,
}

impl InMemoryTimerRepository {
    /// Create a repository over a shared map
    pub fn new(timers: Arc<RwLock<HashMap<String, TimerSubscription>>>) -> Self {
        Self { timers }
    }
}

#[async_trait]
impl TimerRepository for InMemoryTimerRepository {
    async fn save(&self, timer: &TimerSubscription) -> Result<(), EngineError> {
        let mut timers = self.timers.write().await;
        timers.insert(timer.id.0.clone(), timer.clone());
        Ok(())
    }

    async fn find(&self, id: &TimerId) -> Result<Option<TimerSubscription>, EngineError> {
        let timers = self.timers.read().await;
        Ok(timers.get(&id.0).cloned())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerSubscription>, EngineError> {
        let timers = self.timers.read().await;
        let mut due: Vec<TimerSubscription> = timers
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.fire_at);
        Ok(due)
    }

    async fn list_pending_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<TimerSubscription>, EngineError> {
        let timers = self.timers.read().await;
        Ok(timers
            .values()
            .filter(|t| t.instance_id == *instance_id && t.status == TimerStatus::Pending)
            .cloned()
            .collect())
    }
}

/// Event wait index keyed by `(event, correlation)`
pub struct InMemoryCorrelationRepository {
    waits: Arc<RwLock<HashMap<(String, String), Vec<EventWait>>>>,
}

impl InMemoryCorrelationRepository {
    /// Create a repository over a shared map
    pub fn new(waits: Arc<RwLock<HashMap<(String, String), Vec<EventWait>>>>) -> Self {
        Self { waits }
    }
}

#[async_trait]
impl CorrelationRepository for InMemoryCorrelationRepository {
    async fn register(
        &self,
        event: &str,
        correlation: &str,
        wait: EventWait,
    ) -> Result<(), EngineError> {
        let mut waits = self.waits.write().await;
        waits
            .entry((event.to_string(), correlation.to_string()))
            .or_default()
            .push(wait);
        Ok(())
    }

    async fn remove(
        &self,
        event: &str,
        correlation: &str,
        token: &PositionToken,
    ) -> Result<(), EngineError> {
        let mut waits = self.waits.write().await;
        let key = (event.to_string(), correlation.to_string());
        if let Some(entries) = waits.get_mut(&key) {
            entries.retain(|w| &w.token != token);
            if entries.is_empty() {
                waits.remove(&key);
            }
        }
        Ok(())
    }

    async fn find(&self, event: &str, correlation: &str) -> Result<Vec<EventWait>, EngineError> {
        let waits = self.waits.read().await;
        Ok(waits
            .get(&(event.to_string(), correlation.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
