use crate::domain::instance::{InstanceId, PositionToken, TaskId};
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Awaiting completion by the assignee
    Open,
    /// Completed with an output payload
    Completed,
    /// Deadline lapsed before completion
    Expired,
    /// Closed because the owning instance terminated
    Cancelled,
}

impl TaskStatus {
    /// Whether this status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Completed => "COMPLETED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// A unit of human work, opened when execution reaches a task step.
///
/// The ledger is the system of record for work handed to people. Closing a
/// task is idempotent in the direction it already went: completing a
/// completed task reports no change, while completing an expired or
/// cancelled one is a stale signal and is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id
    pub id: TaskId,
    /// Owning instance
    pub instance_id: InstanceId,
    /// Step that opened this task
    pub step_id: String,
    /// Entry token of the position the task belongs to
    pub token: PositionToken,
    /// Principal or role the task is addressed to
    pub assignee: String,
    /// Current status
    pub status: TaskStatus,
    /// Deadline, if the step declared one
    pub due_at: Option<DateTime<Utc>>,
    /// Output recorded at completion
    pub output: Option<Payload>,
    /// Principal that completed the task
    pub completed_by: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the task left the open state
    pub closed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Open a new task for a position
    pub fn new(
        instance_id: InstanceId,
        step_id: &str,
        token: PositionToken,
        assignee: &str,
        due_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: TaskId::new_random(),
            instance_id,
            step_id: step_id.to_string(),
            token,
            assignee: assignee.to_string(),
            status: TaskStatus::Open,
            due_at,
            output: None,
            completed_by: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Complete the task with an output payload, recording who did it.
    ///
    /// Returns `true` if the task transitioned, `false` if it was already
    /// completed (the duplicate is absorbed and the stored output and
    /// actor kept).
    pub fn complete(&mut self, actor: &str, output: Payload) -> Result<bool, EngineError> {
        match self.status {
            TaskStatus::Open => {
                self.status = TaskStatus::Completed;
                self.output = Some(output);
                self.completed_by = Some(actor.to_string());
                self.closed_at = Some(Utc::now());
                Ok(true)
            }
            TaskStatus::Completed => Ok(false),
            other => Err(EngineError::AlreadyTerminal(format!(
                "cannot complete task {} in status {}",
                self.id, other
            ))),
        }
    }

    /// Mark the task expired. Returns `false` if the task already left the
    /// open state, so a late deadline firing is absorbed.
    pub fn expire(&mut self) -> Result<bool, EngineError> {
        match self.status {
            TaskStatus::Open => {
                self.status = TaskStatus::Expired;
                self.closed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Close the task because the owning instance terminated. Returns
    /// `false` if the task already left the open state.
    pub fn cancel(&mut self) -> Result<bool, EngineError> {
        match self.status {
            TaskStatus::Open => {
                self.status = TaskStatus::Cancelled;
                self.closed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new(
            InstanceId::new_random(),
            "approve",
            PositionToken::new_random(),
            "compliance-officer",
            None,
        )
    }

    #[test]
    fn test_new_task_is_open() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Open);
        assert!(t.output.is_none());
        assert!(t.closed_at.is_none());
    }

    #[test]
    fn test_complete_records_actor_and_is_idempotent() {
        let mut t = task();
        assert!(t
            .complete("alice", Payload::from(&json!({"approved": true})).unwrap())
            .unwrap());
        assert_eq!(t.completed_by.as_deref(), Some("alice"));
        let first_output = t.output.clone();
        assert!(!t
            .complete("mallory", Payload::from(&json!({"approved": false})).unwrap())
            .unwrap());
        assert_eq!(t.output, first_output);
        assert_eq!(t.completed_by.as_deref(), Some("alice"));
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn test_complete_after_expiry_is_rejected() {
        let mut t = task();
        assert!(t.expire().unwrap());
        let err = t.complete("alice", Payload::null()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal(_)));
        assert_eq!(t.status, TaskStatus::Expired);
    }

    #[test]
    fn test_expire_after_completion_is_absorbed() {
        let mut t = task();
        t.complete("alice", Payload::null()).unwrap();
        assert!(!t.expire().unwrap());
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn test_cancel_only_closes_open_tasks() {
        let mut t = task();
        assert!(t.cancel().unwrap());
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(!t.cancel().unwrap());
    }
}
