//! The runtime facade hosts embed: one object wiring the definition
//! store, execution engine, task ledger, dispatcher, and event bus.

use crate::application::definition_service::DefinitionService;
use crate::application::dispatcher::Dispatcher;
use crate::application::event_bus::{EventBus, PublishOutcome};
use crate::application::execution::{
    ActionRegistry, AutomaticAction, EngineEventHandler, ExecutionService, StepSignal,
};
use crate::application::task_ledger::TaskLedger;
use crate::application::EngineConfig;
use crate::domain::definition::{DefinitionRef, ProcessDefinition};
use crate::domain::guard::{GuardEvaluator, JmespathGuard};
use crate::domain::instance::{
    DefinitionName, InstanceId, InstanceStatus, ProcessInstance, TaskId,
};
use crate::domain::repository::Repositories;
use crate::domain::task::Task;
use crate::types::{Payload, VariableBag};
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Condensed view of an instance for listings and dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// Instance id
    pub id: InstanceId,
    /// Definition the instance executes
    pub definition: DefinitionRef,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Steps the instance is currently parked at
    pub active_steps: Vec<String>,
    /// Failure reason, when failed
    pub failure: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl From<&ProcessInstance> for InstanceSummary {
    fn from(instance: &ProcessInstance) -> Self {
        Self {
            id: instance.id.clone(),
            definition: instance.definition.clone(),
            status: instance.status,
            active_steps: instance
                .positions
                .iter()
                .map(|p| p.step_id.clone())
                .collect(),
            failure: instance.failure.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Builder for [`ProcessRuntime`]
pub struct RuntimeBuilder {
    repos: Repositories,
    config: EngineConfig,
    actions: ActionRegistry,
    handlers: Vec<Arc<dyn EngineEventHandler>>,
    guard: Arc<dyn GuardEvaluator>,
}

impl RuntimeBuilder {
    /// Start a builder over the given stores
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            config: EngineConfig::default(),
            actions: ActionRegistry::new(),
            handlers: Vec::new(),
            guard: Arc::new(JmespathGuard),
        }
    }

    /// Override the engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an automatic action under a name
    pub fn action(mut self, name: impl Into<String>, action: Arc<dyn AutomaticAction>) -> Self {
        self.actions.register(name, action);
        self
    }

    /// Register a domain event handler
    pub fn event_handler(mut self, handler: Arc<dyn EngineEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Replace the guard evaluator
    pub fn guard(mut self, guard: Arc<dyn GuardEvaluator>) -> Self {
        self.guard = guard;
        self
    }

    /// Wire everything up and start the timer scan loop
    pub fn build(self) -> Arc<ProcessRuntime> {
        let config = Arc::new(self.config);
        let guard = self.guard;
        let execution = Arc::new(ExecutionService::new(
            self.repos.clone(),
            Arc::clone(&guard),
            self.actions,
            self.handlers,
            Arc::clone(&config),
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&execution), config.lane_buffer));
        let event_bus = Arc::new(EventBus::new(
            self.repos.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&execution),
            Arc::clone(&config),
        ));
        let (stop, stop_rx) = watch::channel(false);
        event_bus.start(stop_rx);

        Arc::new(ProcessRuntime {
            definitions: DefinitionService::new(Arc::clone(&self.repos.definitions), guard),
            ledger: TaskLedger::new(Arc::clone(&self.repos.tasks), Arc::clone(&dispatcher)),
            repos: self.repos,
            execution,
            dispatcher,
            event_bus,
            stop,
        })
    }
}

/// The embedded engine: definitions, instances, tasks, timers, and
/// events behind one interface.
pub struct ProcessRuntime {
    repos: Repositories,
    definitions: DefinitionService,
    ledger: TaskLedger,
    execution: Arc<ExecutionService>,
    dispatcher: Arc<Dispatcher>,
    event_bus: Arc<EventBus>,
    stop: watch::Sender<bool>,
}

impl ProcessRuntime {
    /// Start building a runtime
    pub fn builder(repos: Repositories) -> RuntimeBuilder {
        RuntimeBuilder::new(repos)
    }

    /// Validate and publish a definition as the next version of its name
    pub async fn publish_definition(
        &self,
        definition: ProcessDefinition,
    ) -> Result<DefinitionRef, EngineError> {
        self.definitions.publish(definition).await
    }

    /// Withdraw a definition version from new instantiations
    pub async fn deactivate_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<(), EngineError> {
        self.definitions.deactivate(reference).await
    }

    /// Fetch a specific definition version
    pub async fn definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<ProcessDefinition, EngineError> {
        self.definitions.get(reference).await
    }

    /// List every known definition name
    pub async fn definition_names(&self) -> Result<Vec<DefinitionName>, EngineError> {
        self.definitions.list_names().await
    }

    /// List all versions of a definition, oldest first
    pub async fn definition_versions(
        &self,
        name: &DefinitionName,
    ) -> Result<Vec<ProcessDefinition>, EngineError> {
        self.definitions.list_versions(name).await
    }

    /// Start an instance of a definition. With no version given, the
    /// highest active version is used; an explicit version may start
    /// deactivated definitions, which operators use for replays.
    pub async fn instantiate(
        &self,
        name: &DefinitionName,
        version: Option<u32>,
        variables: VariableBag,
    ) -> Result<ProcessInstance, EngineError> {
        let definition = match version {
            Some(version) => {
                self.definitions
                    .get(&DefinitionRef {
                        name: name.clone(),
                        version,
                    })
                    .await?
            }
            None => self.definitions.get_active(name).await?,
        };
        self.execution.instantiate(&definition, variables).await
    }

    /// Route an external event to waiting instances or event-triggered
    /// definitions
    pub async fn publish_event(
        &self,
        name: &str,
        correlation: &str,
        payload: Payload,
    ) -> Result<PublishOutcome, EngineError> {
        self.event_bus.publish(name, correlation, payload).await
    }

    /// Complete an open task on behalf of an actor and advance its
    /// instance
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        actor: &str,
        payload: Payload,
    ) -> Result<ProcessInstance, EngineError> {
        self.ledger.complete(task_id, actor, payload).await
    }

    /// Fetch a task by id
    pub async fn task(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        self.ledger.get(task_id).await
    }

    /// Open tasks addressed to an assignee
    pub async fn tasks_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, EngineError> {
        self.ledger.for_assignee(assignee).await
    }

    /// Every task belonging to an instance
    pub async fn tasks_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<Task>, EngineError> {
        self.ledger.for_instance(instance_id).await
    }

    /// Pause a running instance
    pub async fn suspend(&self, instance_id: &InstanceId) -> Result<ProcessInstance, EngineError> {
        self.dispatcher.signal(instance_id, StepSignal::Suspend).await
    }

    /// Resume a suspended instance
    pub async fn resume(&self, instance_id: &InstanceId) -> Result<ProcessInstance, EngineError> {
        self.dispatcher.signal(instance_id, StepSignal::Resume).await
    }

    /// Terminate an instance, closing its open tasks and timers. The
    /// reason is recorded on the instance.
    pub async fn cancel(
        &self,
        instance_id: &InstanceId,
        reason: &str,
    ) -> Result<ProcessInstance, EngineError> {
        self.dispatcher
            .signal(
                instance_id,
                StepSignal::Cancel {
                    reason: reason.to_string(),
                },
            )
            .await
    }

    /// Operator override: complete one waiting position at a step with an
    /// empty payload
    pub async fn force_advance(
        &self,
        instance_id: &InstanceId,
        step_id: &str,
    ) -> Result<ProcessInstance, EngineError> {
        self.dispatcher
            .signal(
                instance_id,
                StepSignal::ForceAdvance {
                    step_id: step_id.to_string(),
                },
            )
            .await
    }

    /// Fetch an instance by id
    pub async fn instance(&self, instance_id: &InstanceId) -> Result<ProcessInstance, EngineError> {
        self.repos
            .instances
            .find(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    /// Condensed view of an instance
    pub async fn summary(&self, instance_id: &InstanceId) -> Result<InstanceSummary, EngineError> {
        Ok(InstanceSummary::from(&self.instance(instance_id).await?))
    }

    /// List instances in a given status
    pub async fn instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<InstanceSummary>, EngineError> {
        Ok(self
            .repos
            .instances
            .list_by_status(status)
            .await?
            .iter()
            .map(InstanceSummary::from)
            .collect())
    }

    /// Whether the engine is accepting signals. Flips to `false` after an
    /// unrecoverable store failure.
    pub fn is_healthy(&self) -> bool {
        self.dispatcher.is_healthy()
    }

    /// Stop the scan loop and drop the signal lanes
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
        self.dispatcher.shutdown();
    }
}
