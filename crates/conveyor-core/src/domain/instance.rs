use crate::domain::definition::DefinitionRef;
use crate::domain::events::DomainEvent;
use crate::types::VariableBag;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Name shared by all versions of a process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionName(pub String);

impl std::fmt::Display for DefinitionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id of a process instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Generate a random instance id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id of a task ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a random task id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id of a timer subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub String);

impl TimerId {
    /// Generate a random timer id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry token identifying one traversal into a step.
///
/// A loop that re-enters a step gets a fresh token, so stale signals
/// addressed to an earlier traversal cannot complete the later one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionToken(pub String);

impl PositionToken {
    /// Generate a random position token
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for PositionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Advancing or waiting at one or more positions
    Running,
    /// Paused by an operator; only resume and cancel are accepted
    Suspended,
    /// Reached an end step with no other positions outstanding
    Completed,
    /// Halted by an unrecoverable error
    Failed,
    /// Terminated by an operator
    Cancelled,
}

impl InstanceStatus {
    /// Whether this status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// What a parked position is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitKind {
    /// A task ledger entry awaiting human completion
    Task {
        /// The open task
        task_id: TaskId,
    },
    /// A pending timer subscription
    Timer {
        /// The pending timer
        timer_id: TimerId,
    },
    /// An external event match
    Event {
        /// Event name to match
        name: String,
        /// Correlation key resolved at entry
        correlation: String,
    },
    /// A join gateway awaiting sibling branches
    Join,
}

/// A parked traversal of one step within a running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePosition {
    /// Entry token for this traversal
    pub token: PositionToken,
    /// Step the position is parked at
    pub step_id: String,
    /// When the step was entered
    pub entered_at: DateTime<Utc>,
    /// What resuming this position requires
    pub wait: WaitKind,
}

/// One line of an instance's execution history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When it happened
    pub at: DateTime<Utc>,
    /// Step the entry concerns
    pub step_id: String,
    /// What happened
    pub note: String,
}

/// A single run of a process definition.
///
/// The aggregate root of execution state: status, variables, parked
/// positions, join bookkeeping, and an optimistic revision counter the
/// store compares on save. All transitions are status-checked here so no
/// caller can move a terminal instance.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique instance id
    pub id: InstanceId,
    /// Definition version this instance executes, fixed at creation
    pub definition: DefinitionRef,
    /// Current lifecycle status
    pub status: InstanceStatus,
    /// Mutable variable bag
    pub variables: VariableBag,
    /// Parked positions
    pub positions: Vec<ActivePosition>,
    /// Arrival tokens recorded per join step
    pub join_arrivals: HashMap<String, HashSet<String>>,
    /// Failure reason, set when status is `Failed`
    pub failure: Option<String>,
    /// Operator-supplied reason, set when status is `Cancelled`
    #[serde(default)]
    pub cancellation: Option<String>,
    /// Execution history
    pub history: Vec<HistoryEntry>,
    /// Optimistic concurrency counter, incremented by the store on save
    pub revision: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,

    /// Domain events raised since the last `take_events`; not persisted
    #[serde(skip)]
    pending_events: Vec<Box<dyn DomainEvent>>,
}

// Pending events are transient and not cloneable; a clone starts with an
// empty event buffer.
impl Clone for ProcessInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            definition: self.definition.clone(),
            status: self.status,
            variables: self.variables.clone(),
            positions: self.positions.clone(),
            join_arrivals: self.join_arrivals.clone(),
            failure: self.failure.clone(),
            cancellation: self.cancellation.clone(),
            history: self.history.clone(),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
            pending_events: Vec::new(),
        }
    }
}

impl ProcessInstance {
    /// Create a new running instance of the given definition version
    pub fn new(definition: DefinitionRef, variables: VariableBag) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new_random(),
            definition,
            status: InstanceStatus::Running,
            variables,
            positions: Vec::new(),
            join_arrivals: HashMap::new(),
            failure: None,
            cancellation: None,
            history: Vec::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
            pending_events: Vec::new(),
        }
    }

    /// Park a new position at a step
    pub fn add_position(&mut self, step_id: &str, wait: WaitKind) -> PositionToken {
        let token = PositionToken::new_random();
        self.add_position_with_token(token.clone(), step_id, wait);
        token
    }

    /// Park a position under a caller-supplied token, used when the wait
    /// target (a task or timer) already embeds the token
    pub fn add_position_with_token(&mut self, token: PositionToken, step_id: &str, wait: WaitKind) {
        self.positions.push(ActivePosition {
            token,
            step_id: step_id.to_string(),
            entered_at: Utc::now(),
            wait,
        });
        self.touch();
    }

    /// Remove and return the position with the given token
    pub fn remove_position(&mut self, token: &PositionToken) -> Option<ActivePosition> {
        let index = self.positions.iter().position(|p| &p.token == token)?;
        self.touch();
        Some(self.positions.remove(index))
    }

    /// Look up a parked position by token
    pub fn position(&self, token: &PositionToken) -> Option<&ActivePosition> {
        self.positions.iter().find(|p| &p.token == token)
    }

    /// Look up the parked position waiting on the given task
    pub fn position_for_task(&self, task_id: &TaskId) -> Option<&ActivePosition> {
        self.positions
            .iter()
            .find(|p| matches!(&p.wait, WaitKind::Task { task_id: t } if t == task_id))
    }

    /// Look up the parked position waiting on the given timer
    pub fn position_for_timer(&self, timer_id: &TimerId) -> Option<&ActivePosition> {
        self.positions
            .iter()
            .find(|p| matches!(&p.wait, WaitKind::Timer { timer_id: t } if t == timer_id))
    }

    /// Record a branch arrival at a join step. Returns the number of
    /// distinct arrivals so far; re-recording the same token is a no-op.
    pub fn record_join_arrival(&mut self, join_step: &str, token: &PositionToken) -> usize {
        let arrivals = self.join_arrivals.entry(join_step.to_string()).or_default();
        let fresh = arrivals.insert(token.0.clone());
        let count = arrivals.len();
        if fresh {
            self.touch();
        }
        count
    }

    /// Clear join bookkeeping once the join has fired
    pub fn clear_join(&mut self, join_step: &str) {
        self.join_arrivals.remove(join_step);
    }

    /// Append a history line for a step
    pub fn record_history(&mut self, step_id: &str, note: impl Into<String>) {
        self.history.push(HistoryEntry {
            at: Utc::now(),
            step_id: step_id.to_string(),
            note: note.into(),
        });
    }

    /// Pause a running instance
    pub fn suspend(&mut self) -> Result<(), EngineError> {
        match self.status {
            InstanceStatus::Running => {
                self.status = InstanceStatus::Suspended;
                self.touch();
                Ok(())
            }
            other => Err(EngineError::AlreadyTerminal(format!(
                "cannot suspend instance {} in status {}",
                self.id, other
            ))),
        }
    }

    /// Resume a suspended instance
    pub fn resume(&mut self) -> Result<(), EngineError> {
        match self.status {
            InstanceStatus::Suspended => {
                self.status = InstanceStatus::Running;
                self.touch();
                Ok(())
            }
            other => Err(EngineError::AlreadyTerminal(format!(
                "cannot resume instance {} in status {}",
                self.id, other
            ))),
        }
    }

    /// Terminate the instance by operator request, dropping all positions
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(format!(
                "cannot cancel instance {} in status {}",
                self.id, self.status
            )));
        }
        self.status = InstanceStatus::Cancelled;
        self.cancellation = Some(reason.into());
        self.positions.clear();
        self.join_arrivals.clear();
        self.touch();
        Ok(())
    }

    /// Mark the instance complete. Requires a running instance with no
    /// positions left outstanding.
    pub fn complete(&mut self) -> Result<(), EngineError> {
        if self.status != InstanceStatus::Running {
            return Err(EngineError::AlreadyTerminal(format!(
                "cannot complete instance {} in status {}",
                self.id, self.status
            )));
        }
        if !self.positions.is_empty() {
            return Err(EngineError::Other(format!(
                "cannot complete instance {} with {} positions outstanding",
                self.id,
                self.positions.len()
            )));
        }
        self.status = InstanceStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Halt the instance with an unrecoverable error, dropping all positions
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(format!(
                "cannot fail instance {} in status {}",
                self.id, self.status
            )));
        }
        self.status = InstanceStatus::Failed;
        self.failure = Some(reason.into());
        self.positions.clear();
        self.join_arrivals.clear();
        self.touch();
        Ok(())
    }

    /// Buffer a domain event for publication after the next save
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.pending_events.push(event);
    }

    /// Drain the buffered domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.pending_events)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
