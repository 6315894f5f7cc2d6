use crate::domain::definition::DefinitionRef;
use crate::domain::instance::{InstanceId, TaskId, TimerId};
use chrono::{DateTime, Utc};

/// A fact about instance execution, raised by the aggregate and published
/// to registered handlers after the state change is saved.
pub trait DomainEvent: std::fmt::Debug + Send + Sync {
    /// Stable name of the event kind
    fn event_type(&self) -> &'static str;

    /// Instance the event concerns
    fn instance_id(&self) -> &InstanceId;

    /// When the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// An instance was created and entered its start step
#[derive(Debug, Clone)]
pub struct InstanceStarted {
    /// The instance
    pub instance_id: InstanceId,
    /// Definition version it executes
    pub definition: DefinitionRef,
    /// When it started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceStarted {
    fn event_type(&self) -> &'static str {
        "instance.started"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An instance reached an end step with no positions outstanding
#[derive(Debug, Clone)]
pub struct InstanceCompleted {
    /// The instance
    pub instance_id: InstanceId,
    /// When it completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceCompleted {
    fn event_type(&self) -> &'static str {
        "instance.completed"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An instance halted with an unrecoverable error
#[derive(Debug, Clone)]
pub struct InstanceFailed {
    /// The instance
    pub instance_id: InstanceId,
    /// Why it failed
    pub reason: String,
    /// When it failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceFailed {
    fn event_type(&self) -> &'static str {
        "instance.failed"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An instance was terminated by an operator
#[derive(Debug, Clone)]
pub struct InstanceCancelled {
    /// The instance
    pub instance_id: InstanceId,
    /// Operator-supplied reason
    pub reason: String,
    /// When it was cancelled
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceCancelled {
    fn event_type(&self) -> &'static str {
        "instance.cancelled"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An instance was paused by an operator
#[derive(Debug, Clone)]
pub struct InstanceSuspended {
    /// The instance
    pub instance_id: InstanceId,
    /// When it was suspended
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceSuspended {
    fn event_type(&self) -> &'static str {
        "instance.suspended"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A suspended instance resumed running
#[derive(Debug, Clone)]
pub struct InstanceResumed {
    /// The instance
    pub instance_id: InstanceId,
    /// When it resumed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceResumed {
    fn event_type(&self) -> &'static str {
        "instance.resumed"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Execution entered a step
#[derive(Debug, Clone)]
pub struct StepEntered {
    /// The instance
    pub instance_id: InstanceId,
    /// Step that was entered
    pub step_id: String,
    /// When it was entered
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepEntered {
    fn event_type(&self) -> &'static str {
        "step.entered"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A task ledger entry was opened for a task step
#[derive(Debug, Clone)]
pub struct TaskOpened {
    /// The instance
    pub instance_id: InstanceId,
    /// The new task
    pub task_id: TaskId,
    /// Step that opened it
    pub step_id: String,
    /// Assignee the task is addressed to
    pub assignee: String,
    /// When it was opened
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TaskOpened {
    fn event_type(&self) -> &'static str {
        "task.opened"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An open task was completed
#[derive(Debug, Clone)]
pub struct TaskCompleted {
    /// The instance
    pub instance_id: InstanceId,
    /// The completed task
    pub task_id: TaskId,
    /// Principal that completed it
    pub actor: String,
    /// When it was completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TaskCompleted {
    fn event_type(&self) -> &'static str {
        "task.completed"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An open task's deadline lapsed without completion
#[derive(Debug, Clone)]
pub struct TaskExpired {
    /// The instance
    pub instance_id: InstanceId,
    /// The expired task
    pub task_id: TaskId,
    /// When it expired
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TaskExpired {
    fn event_type(&self) -> &'static str {
        "task.expired"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A timer subscription was created for a timer step or task deadline
#[derive(Debug, Clone)]
pub struct TimerScheduled {
    /// The instance
    pub instance_id: InstanceId,
    /// The new timer
    pub timer_id: TimerId,
    /// Step that scheduled it
    pub step_id: String,
    /// When it is due
    pub fire_at: DateTime<Utc>,
    /// When it was scheduled
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TimerScheduled {
    fn event_type(&self) -> &'static str {
        "timer.scheduled"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A due timer was delivered to its instance
#[derive(Debug, Clone)]
pub struct TimerFired {
    /// The instance
    pub instance_id: InstanceId,
    /// The fired timer
    pub timer_id: TimerId,
    /// When it was delivered
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TimerFired {
    fn event_type(&self) -> &'static str {
        "timer.fired"
    }
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::DefinitionName;

    #[test]
    fn test_event_types_are_stable() {
        let id = InstanceId::new_random();
        let started = InstanceStarted {
            instance_id: id.clone(),
            definition: DefinitionRef {
                name: DefinitionName("review".to_string()),
                version: 1,
            },
            timestamp: Utc::now(),
        };
        assert_eq!(started.event_type(), "instance.started");
        assert_eq!(started.instance_id(), &id);

        let failed = InstanceFailed {
            instance_id: id.clone(),
            reason: "boom".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(failed.event_type(), "instance.failed");
    }
}
