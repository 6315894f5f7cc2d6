//! Queries and completion for the task ledger.

use crate::application::dispatcher::Dispatcher;
use crate::application::execution::StepSignal;
use crate::domain::instance::{InstanceId, ProcessInstance, TaskId};
use crate::domain::repository::TaskRepository;
use crate::domain::task::Task;
use crate::types::Payload;
use crate::EngineError;
use std::sync::Arc;

/// Read and complete tasks on behalf of assignees.
///
/// Completion routes through the owning instance's lane, so it is ordered
/// against timer expiry and other signals for the same instance.
pub struct TaskLedger {
    tasks: Arc<dyn TaskRepository>,
    dispatcher: Arc<Dispatcher>,
}

impl TaskLedger {
    /// Create a ledger over the given store and dispatcher
    pub fn new(tasks: Arc<dyn TaskRepository>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { tasks, dispatcher }
    }

    /// Fetch a task by id
    pub async fn get(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        self.tasks
            .find(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// Open tasks addressed to an assignee
    pub async fn for_assignee(&self, assignee: &str) -> Result<Vec<Task>, EngineError> {
        self.tasks.list_open_for_assignee(assignee).await
    }

    /// Every task belonging to an instance, any status
    pub async fn for_instance(&self, instance_id: &InstanceId) -> Result<Vec<Task>, EngineError> {
        self.tasks.list_for_instance(instance_id).await
    }

    /// Complete an open task on behalf of an actor and advance the
    /// owning instance. The actor is recorded on the ledger entry.
    /// Re-completing a completed task is a no-op; completing an expired
    /// or cancelled one is rejected.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        actor: &str,
        payload: Payload,
    ) -> Result<ProcessInstance, EngineError> {
        let task = self.get(task_id).await?;
        self.dispatcher
            .signal(
                &task.instance_id,
                StepSignal::CompleteTask {
                    task_id: task_id.clone(),
                    actor: actor.to_string(),
                    payload,
                },
            )
            .await
    }
}
