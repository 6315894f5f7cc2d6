use crate::domain::definition::{DefinitionRef, ProcessDefinition};
use crate::domain::instance::{
    DefinitionName, InstanceId, InstanceStatus, PositionToken, ProcessInstance, TaskId, TimerId,
};
use crate::domain::task::Task;
use crate::domain::timer::TimerSubscription;
use crate::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Store for published process definitions.
///
/// Versions are immutable once saved; the service layer assigns version
/// numbers and never overwrites an existing one.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Persist a definition version
    async fn save(&self, definition: &ProcessDefinition) -> Result<(), EngineError>;

    /// Fetch a specific definition version
    async fn find(&self, reference: &DefinitionRef)
        -> Result<Option<ProcessDefinition>, EngineError>;

    /// Fetch the highest active version of a definition
    async fn find_active(
        &self,
        name: &DefinitionName,
    ) -> Result<Option<ProcessDefinition>, EngineError>;

    /// List all versions of a definition, oldest first
    async fn list_versions(
        &self,
        name: &DefinitionName,
    ) -> Result<Vec<ProcessDefinition>, EngineError>;

    /// List every definition name known to the store
    async fn list_names(&self) -> Result<Vec<DefinitionName>, EngineError>;
}

/// Store for process instances with optimistic concurrency.
///
/// `save` compares the instance's revision against the stored one and
/// persists with the revision incremented; a mismatch is a
/// `ConcurrencyConflict` and the caller reloads and reapplies.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Persist the instance if its revision matches the stored revision.
    /// Returns the new revision.
    async fn save(&self, instance: &ProcessInstance) -> Result<u64, EngineError>;

    /// Fetch an instance by id
    async fn find(&self, id: &InstanceId) -> Result<Option<ProcessInstance>, EngineError>;

    /// List instances in a given status
    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<ProcessInstance>, EngineError>;

    /// List every instance of a definition, any version
    async fn list_by_definition(
        &self,
        name: &DefinitionName,
    ) -> Result<Vec<ProcessInstance>, EngineError>;
}

/// Store for task ledger entries
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist a task
    async fn save(&self, task: &Task) -> Result<(), EngineError>;

    /// Fetch a task by id
    async fn find(&self, id: &TaskId) -> Result<Option<Task>, EngineError>;

    /// List every task belonging to an instance
    async fn list_for_instance(&self, instance_id: &InstanceId) -> Result<Vec<Task>, EngineError>;

    /// List open tasks addressed to an assignee
    async fn list_open_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, EngineError>;
}

/// Store for durable timer subscriptions
#[async_trait]
pub trait TimerRepository: Send + Sync {
    /// Persist a timer subscription
    async fn save(&self, timer: &TimerSubscription) -> Result<(), EngineError>;

    /// Fetch a timer by id
    async fn find(&self, id: &TimerId) -> Result<Option<TimerSubscription>, EngineError>;

    /// List pending timers due at or before the given time
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerSubscription>, EngineError>;

    /// List pending timers belonging to an instance
    async fn list_pending_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<TimerSubscription>, EngineError>;
}

/// A registered event wait: which position of which instance resumes when
/// a matching external event arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWait {
    /// Instance to resume
    pub instance_id: InstanceId,
    /// Position the wait belongs to
    pub token: PositionToken,
}

/// Index of positions waiting on external events, keyed by event name and
/// correlation value.
#[async_trait]
pub trait CorrelationRepository: Send + Sync {
    /// Register a wait for `(event, correlation)`
    async fn register(
        &self,
        event: &str,
        correlation: &str,
        wait: EventWait,
    ) -> Result<(), EngineError>;

    /// Remove a registered wait; absent waits are ignored
    async fn remove(
        &self,
        event: &str,
        correlation: &str,
        token: &PositionToken,
    ) -> Result<(), EngineError>;

    /// Find all waits registered for `(event, correlation)`
    async fn find(&self, event: &str, correlation: &str) -> Result<Vec<EventWait>, EngineError>;
}

/// The full set of stores the engine runs against
#[derive(Clone)]
pub struct Repositories {
    /// Definition store
    pub definitions: Arc<dyn DefinitionRepository>,
    /// Instance store
    pub instances: Arc<dyn InstanceRepository>,
    /// Task ledger store
    pub tasks: Arc<dyn TaskRepository>,
    /// Timer store
    pub timers: Arc<dyn TimerRepository>,
    /// Event wait index
    pub correlations: Arc<dyn CorrelationRepository>,
}

/// In-memory repositories for tests and examples
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;

    /// DashMap-backed definition store
    #[derive(Default)]
    pub struct MemoryDefinitionRepository {
        definitions: DashMap<(String, u32), ProcessDefinition>,
    }

    impl MemoryDefinitionRepository {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DefinitionRepository for MemoryDefinitionRepository {
        async fn save(&self, definition: &ProcessDefinition) -> Result<(), EngineError> {
            self.definitions.insert(
                (definition.name.0.clone(), definition.version),
                definition.clone(),
            );
            Ok(())
        }

        async fn find(
            &self,
            reference: &DefinitionRef,
        ) -> Result<Option<ProcessDefinition>, EngineError> {
            Ok(self
                .definitions
                .get(&(reference.name.0.clone(), reference.version))
                .map(|entry| entry.clone()))
        }

        async fn find_active(
            &self,
            name: &DefinitionName,
        ) -> Result<Option<ProcessDefinition>, EngineError> {
            Ok(self
                .definitions
                .iter()
                .filter(|entry| entry.key().0 == name.0 && entry.value().active)
                .max_by_key(|entry| entry.key().1)
                .map(|entry| entry.value().clone()))
        }

        async fn list_versions(
            &self,
            name: &DefinitionName,
        ) -> Result<Vec<ProcessDefinition>, EngineError> {
            let mut versions: Vec<ProcessDefinition> = self
                .definitions
                .iter()
                .filter(|entry| entry.key().0 == name.0)
                .map(|entry| entry.value().clone())
                .collect();
            versions.sort_by_key(|d| d.version);
            Ok(versions)
        }

        async fn list_names(&self) -> Result<Vec<DefinitionName>, EngineError> {
            let mut names: Vec<String> = self
                .definitions
                .iter()
                .map(|entry| entry.key().0.clone())
                .collect();
            names.sort();
            names.dedup();
            Ok(names.into_iter().map(DefinitionName).collect())
        }
    }

    /// DashMap-backed instance store with revision checking
    #[derive(Default)]
    pub struct MemoryInstanceRepository {
        instances: DashMap<String, ProcessInstance>,
    }

    impl MemoryInstanceRepository {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl InstanceRepository for MemoryInstanceRepository {
        async fn save(&self, instance: &ProcessInstance) -> Result<u64, EngineError> {
            // The entry lock makes compare-and-swap atomic per instance.
            let mut entry = self
                .instances
                .entry(instance.id.0.clone())
                .or_insert_with(|| instance.clone());
            if entry.revision != instance.revision {
                return Err(EngineError::ConcurrencyConflict(format!(
                    "instance {} is at revision {}, save expected {}",
                    instance.id, entry.revision, instance.revision
                )));
            }
            let mut saved = instance.clone();
            saved.revision += 1;
            let revision = saved.revision;
            *entry = saved;
            Ok(revision)
        }

        async fn find(&self, id: &InstanceId) -> Result<Option<ProcessInstance>, EngineError> {
            Ok(self.instances.get(&id.0).map(|entry| entry.clone()))
        }

        async fn list_by_status(
            &self,
            status: InstanceStatus,
        ) -> Result<Vec<ProcessInstance>, EngineError> {
            Ok(self
                .instances
                .iter()
                .filter(|entry| entry.value().status == status)
                .map(|entry| entry.value().clone())
                .collect())
        }

        async fn list_by_definition(
            &self,
            name: &DefinitionName,
        ) -> Result<Vec<ProcessInstance>, EngineError> {
            Ok(self
                .instances
                .iter()
                .filter(|entry| entry.value().definition.name == *name)
                .map(|entry| entry.value().clone())
                .collect())
        }
    }

    /// DashMap-backed task ledger store
    #[derive(Default)]
    pub struct MemoryTaskRepository {
        tasks: DashMap<String, Task>,
    }

    impl MemoryTaskRepository {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl TaskRepository for MemoryTaskRepository {
        async fn save(&self, task: &Task) -> Result<(), EngineError> {
            self.tasks.insert(task.id.0.clone(), task.clone());
            Ok(())
        }

        async fn find(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
            Ok(self.tasks.get(&id.0).map(|entry| entry.clone()))
        }

        async fn list_for_instance(
            &self,
            instance_id: &InstanceId,
        ) -> Result<Vec<Task>, EngineError> {
            Ok(self
                .tasks
                .iter()
                .filter(|entry| entry.value().instance_id == *instance_id)
                .map(|entry| entry.value().clone())
                .collect())
        }

        async fn list_open_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, EngineError> {
            Ok(self
                .tasks
                .iter()
                .filter(|entry| {
                    entry.value().assignee == assignee
                        && entry.value().status == crate::domain::task::TaskStatus::Open
                })
                .map(|entry| entry.value().clone())
                .collect())
        }
    }

    /// DashMap-backed timer store
    #[derive(Default)]
    pub struct MemoryTimerRepository {
        timers: DashMap<String, TimerSubscription>,
    }

    impl MemoryTimerRepository {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl TimerRepository for MemoryTimerRepository {
        async fn save(&self, timer: &TimerSubscription) -> Result<(), EngineError> {
            self.timers.insert(timer.id.0.clone(), timer.clone());
            Ok(())
        }

        async fn find(&self, id: &TimerId) -> Result<Option<TimerSubscription>, EngineError> {
            Ok(self.timers.get(&id.0).map(|entry| entry.clone()))
        }

        async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerSubscription>, EngineError> {
            let mut due: Vec<TimerSubscription> = self
                .timers
                .iter()
                .filter(|entry| entry.value().is_due(now))
                .map(|entry| entry.value().clone())
                .collect();
            due.sort_by_key(|t| t.fire_at);
            Ok(due)
        }

        async fn list_pending_for_instance(
            &self,
            instance_id: &InstanceId,
        ) -> Result<Vec<TimerSubscription>, EngineError> {
            Ok(self
                .timers
                .iter()
                .filter(|entry| {
                    entry.value().instance_id == *instance_id
                        && entry.value().status == crate::domain::timer::TimerStatus::Pending
                })
                .map(|entry| entry.value().clone())
                .collect())
        }
    }

    /// DashMap-backed event wait index
    #[derive(Default)]
    pub struct MemoryCorrelationRepository {
        waits: DashMap<(String, String), Vec<EventWait>>,
    }

    impl MemoryCorrelationRepository {
        /// Create an empty index
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CorrelationRepository for MemoryCorrelationRepository {
        async fn register(
            &self,
            event: &str,
            correlation: &str,
            wait: EventWait,
        ) -> Result<(), EngineError> {
            self.waits
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
            if let Some(mut entry) = self
                .waits
                .get_mut(&(event.to_string(), correlation.to_string()))
            {
                entry.retain(|wait| &wait.token != token);
            }
            Ok(())
        }

        async fn find(
            &self,
            event: &str,
            correlation: &str,
        ) -> Result<Vec<EventWait>, EngineError> {
            Ok(self
                .waits
                .get(&(event.to_string(), correlation.to_string()))
                .map(|entry| entry.clone())
                .unwrap_or_default())
        }
    }

    /// Build a full in-memory repository set
    pub fn repositories() -> Repositories {
        Repositories {
            definitions: Arc::new(MemoryDefinitionRepository::new()),
            instances: Arc::new(MemoryInstanceRepository::new()),
            tasks: Arc::new(MemoryTaskRepository::new()),
            timers: Arc::new(MemoryTimerRepository::new()),
            correlations: Arc::new(MemoryCorrelationRepository::new()),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::domain::definition::TriggerSpec;
        use crate::domain::instance::ProcessInstance;
        use crate::types::VariableBag;

        fn definition(name: &str, version: u32, active: bool) -> ProcessDefinition {
            ProcessDefinition {
                name: DefinitionName(name.to_string()),
                version,
                description: None,
                start: "done".to_string(),
                steps: vec![crate::domain::definition::StepSpec {
                    id: "done".to_string(),
                    kind: crate::domain::definition::StepKind::End,
                    edges: vec![],
                }],
                trigger: TriggerSpec::Manual,
                active,
            }
        }

        #[tokio::test]
        async fn test_find_active_picks_highest_active_version() {
            let repo = MemoryDefinitionRepository::new();
            repo.save(&definition("review", 1, true)).await.unwrap();
            repo.save(&definition("review", 2, true)).await.unwrap();
            repo.save(&definition("review", 3, false)).await.unwrap();

            let active = repo
                .find_active(&DefinitionName("review".to_string()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(active.version, 2);
        }

        #[tokio::test]
        async fn test_instance_save_rejects_stale_revision() {
            let repo = MemoryInstanceRepository::new();
            let instance = ProcessInstance::new(
                DefinitionRef {
                    name: DefinitionName("review".to_string()),
                    version: 1,
                },
                VariableBag::new(),
            );

            let revision = repo.save(&instance).await.unwrap();
            assert_eq!(revision, 1);

            // A second save from the same snapshot carries revision 0 and
            // must lose to the first.
            let err = repo.save(&instance).await.unwrap_err();
            assert!(matches!(err, EngineError::ConcurrencyConflict(_)));

            let mut fresh = repo.find(&instance.id).await.unwrap().unwrap();
            assert_eq!(fresh.revision, 1);
            fresh.record_history("done", "noted");
            assert_eq!(repo.save(&fresh).await.unwrap(), 2);
        }

        #[tokio::test]
        async fn test_due_timers_are_sorted_and_filtered() {
            use crate::domain::timer::{TimerPurpose, TimerSubscription};
            use chrono::Duration;

            let repo = MemoryTimerRepository::new();
            let now = Utc::now();
            let instance_id = InstanceId::new_random();

            let late = TimerSubscription::new(
                instance_id.clone(),
                PositionToken::new_random(),
                TimerPurpose::Delay,
                now - Duration::seconds(1),
            );
            let early = TimerSubscription::new(
                instance_id.clone(),
                PositionToken::new_random(),
                TimerPurpose::Delay,
                now - Duration::seconds(10),
            );
            let future = TimerSubscription::new(
                instance_id,
                PositionToken::new_random(),
                TimerPurpose::Delay,
                now + Duration::seconds(60),
            );
            repo.save(&late).await.unwrap();
            repo.save(&early).await.unwrap();
            repo.save(&future).await.unwrap();

            let due = repo.due(now).await.unwrap();
            assert_eq!(due.len(), 2);
            assert_eq!(due[0].id, early.id);
            assert_eq!(due[1].id, late.id);
        }

        #[tokio::test]
        async fn test_correlation_register_find_remove() {
            let repo = MemoryCorrelationRepository::new();
            let wait = EventWait {
                instance_id: InstanceId::new_random(),
                token: PositionToken::new_random(),
            };
            repo.register("payment.received", "order-42", wait.clone())
                .await
                .unwrap();

            let found = repo.find("payment.received", "order-42").await.unwrap();
            assert_eq!(found, vec![wait.clone()]);
            assert!(repo
                .find("payment.received", "order-43")
                .await
                .unwrap()
                .is_empty());

            repo.remove("payment.received", "order-42", &wait.token)
                .await
                .unwrap();
            assert!(repo
                .find("payment.received", "order-42")
                .await
                .unwrap()
                .is_empty());
        }
    }
}
