use crate::domain::instance::{InstanceId, PositionToken, TaskId, TimerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a timer firing means to the instance that scheduled it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerPurpose {
    /// Resume a position parked at a timer step
    Delay,
    /// Expire an open task whose deadline lapsed
    TaskDeadline {
        /// The task to expire
        task_id: TaskId,
    },
}

/// Lifecycle status of a timer subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerStatus {
    /// Waiting for its due time
    Pending,
    /// Delivered to the engine
    Fired,
    /// Withdrawn before firing
    Cancelled,
}

/// A durable request to be woken at a point in time.
///
/// Subscriptions survive restarts through the timer repository; the scan
/// loop delivers due ones at-least-once, so firing is recorded here and a
/// duplicate delivery is absorbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerSubscription {
    /// Unique timer id
    pub id: TimerId,
    /// Owning instance
    pub instance_id: InstanceId,
    /// Entry token of the position the timer belongs to
    pub token: PositionToken,
    /// What firing means
    pub purpose: TimerPurpose,
    /// When to fire
    pub fire_at: DateTime<Utc>,
    /// Current status
    pub status: TimerStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl TimerSubscription {
    /// Schedule a new pending timer
    pub fn new(
        instance_id: InstanceId,
        token: PositionToken,
        purpose: TimerPurpose,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TimerId::new_random(),
            instance_id,
            token,
            purpose,
            fire_at,
            status: TimerStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Whether the timer is due at the given time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TimerStatus::Pending && self.fire_at <= now
    }

    /// Record delivery. Returns `false` if the timer already fired or was
    /// cancelled, absorbing duplicate deliveries.
    pub fn fire(&mut self) -> bool {
        if self.status == TimerStatus::Pending {
            self.status = TimerStatus::Fired;
            true
        } else {
            false
        }
    }

    /// Withdraw a pending timer. Returns `false` if it already left the
    /// pending state.
    pub fn cancel(&mut self) -> bool {
        if self.status == TimerStatus::Pending {
            self.status = TimerStatus::Cancelled;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn timer(fire_at: DateTime<Utc>) -> TimerSubscription {
        TimerSubscription::new(
            InstanceId::new_random(),
            PositionToken::new_random(),
            TimerPurpose::Delay,
            fire_at,
        )
    }

    #[test]
    fn test_due_only_when_pending_and_past() {
        let now = Utc::now();
        let mut t = timer(now - Duration::seconds(1));
        assert!(t.is_due(now));
        assert!(!timer(now + Duration::seconds(60)).is_due(now));
        t.fire();
        assert!(!t.is_due(now));
    }

    #[test]
    fn test_fire_is_idempotent() {
        let mut t = timer(Utc::now());
        assert!(t.fire());
        assert!(!t.fire());
        assert_eq!(t.status, TimerStatus::Fired);
    }

    #[test]
    fn test_cancel_pending_only() {
        let mut t = timer(Utc::now());
        assert!(t.cancel());
        assert!(!t.fire());
        assert_eq!(t.status, TimerStatus::Cancelled);
    }
}
