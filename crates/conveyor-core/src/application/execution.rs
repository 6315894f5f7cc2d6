//! The execution engine: applies one signal to one instance, advancing it
//! through the definition graph until every branch is parked or done.
//!
//! Mutations follow a snapshot-and-save discipline. A signal loads the
//! instance, applies the change in memory while collecting side effects
//! (tasks to open, timers to schedule, correlation entries), then saves
//! the instance under its optimistic revision. Side effects are persisted
//! only after the save wins, so a conflicting writer never leaks them.

use crate::application::EngineConfig;
use crate::domain::definition::{
    EdgeTrigger, GatewayKind, ProcessDefinition, StepKind, StepSpec,
};
use crate::domain::events::{
    DomainEvent, InstanceCancelled, InstanceCompleted, InstanceFailed, InstanceResumed,
    InstanceStarted, InstanceSuspended, StepEntered, TaskCompleted, TaskExpired, TaskOpened,
    TimerFired, TimerScheduled,
};
use crate::domain::guard::GuardEvaluator;
use crate::domain::instance::{
    InstanceId, InstanceStatus, PositionToken, ProcessInstance, TaskId, TimerId, WaitKind,
};
use crate::domain::repository::{EventWait, Repositories};
use crate::domain::task::Task;
use crate::domain::timer::{TimerPurpose, TimerSubscription};
use crate::types::{Payload, VariableBag};
use crate::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered side-effect handler for automatic steps.
///
/// Implementations must be idempotent: a crash between the collaborator
/// call and the instance save means the call is repeated on recovery.
#[async_trait]
pub trait AutomaticAction: Send + Sync {
    /// Perform the action. `config` is the step's configuration verbatim;
    /// the returned payload is merged into the instance variables.
    async fn execute(
        &self,
        config: &Value,
        variables: &VariableBag,
    ) -> Result<Payload, EngineError>;
}

/// Named registry of automatic actions
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn AutomaticAction>>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under a name
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn AutomaticAction>) {
        self.actions.insert(name.into(), action);
    }

    /// Look up an action by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn AutomaticAction>> {
        self.actions.get(name).cloned()
    }
}

/// Receives domain events after the state change that raised them is
/// saved. Handler failures are logged and never roll execution back.
#[async_trait]
pub trait EngineEventHandler: Send + Sync {
    /// Handle one event
    async fn handle(&self, event: &dyn DomainEvent) -> Result<(), EngineError>;
}

/// An input that moves one instance forward
#[derive(Debug, Clone)]
pub enum StepSignal {
    /// An assignee completed an open task
    CompleteTask {
        /// The task
        task_id: TaskId,
        /// Principal completing the task, recorded on the ledger entry
        actor: String,
        /// Output merged into instance variables
        payload: Payload,
    },
    /// A durable timer came due
    TimerFired {
        /// The timer
        timer_id: TimerId,
    },
    /// An external event matched a registered wait
    EventMatched {
        /// Token of the waiting position
        token: PositionToken,
        /// Event payload merged into instance variables
        payload: Payload,
    },
    /// Operator: pause the instance
    Suspend,
    /// Operator: resume a suspended instance
    Resume,
    /// Operator: terminate the instance
    Cancel {
        /// Why the instance is being cancelled, recorded on the instance
        reason: String,
    },
    /// Operator: complete one waiting position at a step with an empty
    /// payload, skipping whatever it waits on
    ForceAdvance {
        /// Step the position is parked at
        step_id: String,
    },
}

/// Side effects collected while advancing, persisted after the instance
/// save wins
#[derive(Default)]
struct SideEffects {
    tasks: Vec<Task>,
    timers: Vec<TimerSubscription>,
    register_waits: Vec<(String, String, EventWait)>,
    remove_waits: Vec<(String, String, PositionToken)>,
}

/// Applies signals to instances and advances them through their
/// definition graph.
pub struct ExecutionService {
    repos: Repositories,
    guard: Arc<dyn GuardEvaluator>,
    actions: ActionRegistry,
    handlers: Vec<Arc<dyn EngineEventHandler>>,
    config: Arc<EngineConfig>,
}

impl ExecutionService {
    /// Create a service over the given stores
    pub fn new(
        repos: Repositories,
        guard: Arc<dyn GuardEvaluator>,
        actions: ActionRegistry,
        handlers: Vec<Arc<dyn EngineEventHandler>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repos,
            guard,
            actions,
            handlers,
            config,
        }
    }

    /// Create a new instance of a definition and run it to its first wait
    /// points (or completion).
    pub async fn instantiate(
        &self,
        definition: &ProcessDefinition,
        variables: VariableBag,
    ) -> Result<ProcessInstance, EngineError> {
        let reference = crate::domain::definition::DefinitionRef {
            name: definition.name.clone(),
            version: definition.version,
        };
        let mut instance = ProcessInstance::new(reference.clone(), variables);
        info!(
            instance_id = %instance.id,
            definition = %reference.name,
            version = reference.version,
            "instantiating process"
        );
        instance.record_event(Box::new(InstanceStarted {
            instance_id: instance.id.clone(),
            definition: reference,
            timestamp: Utc::now(),
        }));

        let mut effects = SideEffects::default();
        let entry = vec![(definition.start.clone(), PositionToken::new_random())];
        if let Err(e) = self
            .advance(definition, &mut instance, entry, &mut effects)
            .await
        {
            if e.is_instance_contained() {
                self.contain_failure(&mut instance, &mut effects, e).await?;
            } else {
                return Err(e);
            }
        }

        let revision = self.repos.instances.save(&instance).await?;
        instance.revision = revision;
        self.apply_effects(effects).await?;
        self.publish(instance.take_events()).await;
        Ok(instance)
    }

    /// Apply one signal to one instance, retrying locally when an
    /// optimistic save loses.
    pub async fn apply(
        &self,
        instance_id: &InstanceId,
        signal: StepSignal,
    ) -> Result<ProcessInstance, EngineError> {
        for attempt in 0..self.config.conflict_retry_limit {
            let mut instance = self
                .repos
                .instances
                .find(instance_id)
                .await?
                .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
            let definition = self
                .repos
                .definitions
                .find(&instance.definition)
                .await?
                .ok_or_else(|| {
                    EngineError::StoreError(format!(
                        "definition {} v{} missing for instance {}",
                        instance.definition.name, instance.definition.version, instance_id
                    ))
                })?;

            let mut effects = SideEffects::default();
            let changed = match self
                .apply_signal(&definition, &mut instance, &signal, &mut effects)
                .await
            {
                Ok(changed) => changed,
                Err(e) if e.is_instance_contained() => {
                    self.contain_failure(&mut instance, &mut effects, e).await?;
                    true
                }
                Err(e) => return Err(e),
            };

            if changed {
                match self.repos.instances.save(&instance).await {
                    Ok(revision) => instance.revision = revision,
                    Err(EngineError::ConcurrencyConflict(reason)) => {
                        debug!(
                            instance_id = %instance_id,
                            attempt,
                            %reason,
                            "optimistic save lost, reloading"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.apply_effects(effects).await?;
            self.publish(instance.take_events()).await;
            return Ok(instance);
        }

        Err(EngineError::StoreError(format!(
            "gave up on instance {} after {} conflicting saves",
            instance_id, self.config.conflict_retry_limit
        )))
    }

    /// Apply the signal's direct mutation, then advance released branches.
    /// Returns whether the instance itself changed.
    async fn apply_signal(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        signal: &StepSignal,
        effects: &mut SideEffects,
    ) -> Result<bool, EngineError> {
        match signal {
            StepSignal::Suspend => {
                instance.suspend()?;
                instance.record_event(Box::new(InstanceSuspended {
                    instance_id: instance.id.clone(),
                    timestamp: Utc::now(),
                }));
                Ok(true)
            }

            StepSignal::Resume => {
                instance.resume()?;
                instance.record_event(Box::new(InstanceResumed {
                    instance_id: instance.id.clone(),
                    timestamp: Utc::now(),
                }));
                Ok(true)
            }

            StepSignal::Cancel { reason } => {
                self.close_out_waits(instance, effects).await?;
                instance.cancel(reason)?;
                instance.record_event(Box::new(InstanceCancelled {
                    instance_id: instance.id.clone(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                }));
                Ok(true)
            }

            StepSignal::CompleteTask {
                task_id,
                actor,
                payload,
            } => {
                self.complete_task(definition, instance, task_id, actor, payload, effects)
                    .await
            }

            StepSignal::TimerFired { timer_id } => {
                self.timer_fired(definition, instance, timer_id, effects)
                    .await
            }

            StepSignal::EventMatched { token, payload } => {
                self.event_matched(definition, instance, token, payload, effects)
                    .await
            }

            StepSignal::ForceAdvance { step_id } => {
                self.force_advance(definition, instance, step_id, effects)
                    .await
            }
        }
    }

    async fn complete_task(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        task_id: &TaskId,
        actor: &str,
        payload: &Payload,
        effects: &mut SideEffects,
    ) -> Result<bool, EngineError> {
        let mut task = self
            .repos
            .tasks
            .find(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if task.instance_id != instance.id {
            return Err(EngineError::Other(format!(
                "task {} does not belong to instance {}",
                task_id, instance.id
            )));
        }
        // Duplicate completions are absorbed even after the instance
        // finished, so a retried submission never surfaces an error.
        if task.status == crate::domain::task::TaskStatus::Completed {
            debug!(task_id = %task_id, "duplicate task completion absorbed");
            return Ok(false);
        }
        if instance.status == InstanceStatus::Suspended {
            return Err(EngineError::Other(format!(
                "instance {} is suspended",
                instance.id
            )));
        }
        if instance.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(format!(
                "instance {} is {}",
                instance.id, instance.status
            )));
        }

        if !task.complete(actor, payload.clone())? {
            return Ok(false);
        }
        effects.tasks.push(task.clone());
        self.cancel_deadline_timers(instance, task_id, effects)
            .await?;
        instance.record_event(Box::new(TaskCompleted {
            instance_id: instance.id.clone(),
            task_id: task_id.clone(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }));

        let Some(position) = instance.position_for_task(task_id).cloned() else {
            warn!(task_id = %task_id, instance_id = %instance.id, "completed task had no waiting position");
            return Ok(true);
        };
        instance.remove_position(&position.token);
        self.merge_payload(instance, &position.step_id, payload);
        instance.record_history(
            &position.step_id,
            format!("task {} completed by {}", task_id, actor),
        );

        let next = self.route(&step(definition, &position.step_id)?, EdgeTrigger::Completed, instance)?;
        self.advance(definition, instance, vec![(next, position.token)], effects)
            .await?;
        Ok(true)
    }

    async fn timer_fired(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        timer_id: &TimerId,
        effects: &mut SideEffects,
    ) -> Result<bool, EngineError> {
        let Some(mut timer) = self.repos.timers.find(timer_id).await? else {
            warn!(timer_id = %timer_id, "fired timer not found");
            return Ok(false);
        };

        // A suspended instance leaves the timer pending; the scan loop
        // redelivers it after resume.
        if instance.status == InstanceStatus::Suspended {
            return Ok(false);
        }
        if instance.status.is_terminal() {
            if timer.fire() {
                effects.timers.push(timer);
            }
            return Ok(false);
        }
        if !timer.fire() {
            return Ok(false);
        }
        effects.timers.push(timer.clone());
        instance.record_event(Box::new(TimerFired {
            instance_id: instance.id.clone(),
            timer_id: timer.id.clone(),
            timestamp: Utc::now(),
        }));

        match &timer.purpose {
            TimerPurpose::Delay => {
                let Some(position) = instance.position_for_timer(timer_id).cloned() else {
                    warn!(timer_id = %timer_id, instance_id = %instance.id, "fired timer had no waiting position");
                    return Ok(false);
                };
                instance.remove_position(&position.token);
                instance.record_history(&position.step_id, "timer elapsed");
                let next =
                    self.route(&step(definition, &position.step_id)?, EdgeTrigger::Completed, instance)?;
                self.advance(definition, instance, vec![(next, position.token)], effects)
                    .await?;
                Ok(true)
            }

            TimerPurpose::TaskDeadline { task_id } => {
                let mut task = self
                    .repos
                    .tasks
                    .find(task_id)
                    .await?
                    .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
                if !task.expire()? {
                    debug!(task_id = %task_id, "deadline fired after task closed, absorbed");
                    return Ok(false);
                }
                effects.tasks.push(task.clone());
                instance.record_event(Box::new(TaskExpired {
                    instance_id: instance.id.clone(),
                    task_id: task_id.clone(),
                    timestamp: Utc::now(),
                }));

                let Some(position) = instance.position_for_task(task_id).cloned() else {
                    warn!(task_id = %task_id, instance_id = %instance.id, "expired task had no waiting position");
                    return Ok(true);
                };
                instance.remove_position(&position.token);
                instance.record_history(&position.step_id, format!("task {} expired", task_id));

                let spec = step(definition, &position.step_id)?;
                let has_expiry_route = spec
                    .edges
                    .iter()
                    .any(|edge| edge.trigger == EdgeTrigger::Expired);
                if !has_expiry_route {
                    return Err(EngineError::StepConfigError(format!(
                        "task step {} has no route for expiry",
                        position.step_id
                    )));
                }
                let next = self.route(&spec, EdgeTrigger::Expired, instance)?;
                self.advance(definition, instance, vec![(next, position.token)], effects)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn event_matched(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        token: &PositionToken,
        payload: &Payload,
        effects: &mut SideEffects,
    ) -> Result<bool, EngineError> {
        // A suspended instance keeps the wait registered and the position
        // parked; the bus observes this and holds the event for replay.
        if instance.status == InstanceStatus::Suspended {
            debug!(token = %token, instance_id = %instance.id, "event for suspended instance deferred");
            return Ok(false);
        }
        if instance.status.is_terminal() {
            return Ok(false);
        }
        let Some(position) = instance.position(token).cloned() else {
            debug!(token = %token, instance_id = %instance.id, "event addressed a stale position, dropped");
            return Ok(false);
        };
        let WaitKind::Event { name, correlation } = &position.wait else {
            return Err(EngineError::Other(format!(
                "position {} at step {} is not waiting on an event",
                token, position.step_id
            )));
        };
        effects
            .remove_waits
            .push((name.clone(), correlation.clone(), token.clone()));

        instance.remove_position(token);
        self.merge_payload(instance, &position.step_id, payload);
        instance.record_history(&position.step_id, format!("event {} received", name));

        let next = self.route(&step(definition, &position.step_id)?, EdgeTrigger::Completed, instance)?;
        self.advance(definition, instance, vec![(next, position.token.clone())], effects)
            .await?;
        Ok(true)
    }

    async fn force_advance(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        step_id: &str,
        effects: &mut SideEffects,
    ) -> Result<bool, EngineError> {
        if instance.status == InstanceStatus::Suspended {
            return Err(EngineError::Other(format!(
                "instance {} is suspended",
                instance.id
            )));
        }
        if instance.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(format!(
                "instance {} is {}",
                instance.id, instance.status
            )));
        }
        let Some(position) = instance
            .positions
            .iter()
            .find(|p| p.step_id == step_id)
            .cloned()
        else {
            return Err(EngineError::Other(format!(
                "instance {} has no waiting position at step {}",
                instance.id, step_id
            )));
        };

        match &position.wait {
            WaitKind::Task { task_id } => {
                let mut task = self
                    .repos
                    .tasks
                    .find(task_id)
                    .await?
                    .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
                if task.complete("operator", Payload::null())? {
                    effects.tasks.push(task);
                }
                self.cancel_deadline_timers(instance, task_id, effects)
                    .await?;
            }
            WaitKind::Timer { timer_id } => {
                if let Some(mut timer) = self.repos.timers.find(timer_id).await? {
                    if timer.fire() {
                        effects.timers.push(timer);
                    }
                }
            }
            WaitKind::Event { name, correlation } => {
                effects.remove_waits.push((
                    name.clone(),
                    correlation.clone(),
                    position.token.clone(),
                ));
            }
            WaitKind::Join => {
                instance.clear_join(step_id);
            }
        }

        instance.remove_position(&position.token);
        instance.record_history(step_id, "advanced by operator");
        let next = self.route(&step(definition, step_id)?, EdgeTrigger::Completed, instance)?;
        self.advance(definition, instance, vec![(next, position.token)], effects)
            .await?;
        Ok(true)
    }

    /// Walk the graph from the given entry points, running automatic and
    /// gateway steps synchronously and parking at wait points.
    async fn advance(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        entries: Vec<(String, PositionToken)>,
        effects: &mut SideEffects,
    ) -> Result<(), EngineError> {
        let mut worklist: VecDeque<(String, PositionToken)> = entries.into();
        let mut budget = self.config.max_steps_per_signal;

        while let Some((step_id, branch)) = worklist.pop_front() {
            if budget == 0 {
                return Err(EngineError::StepConfigError(format!(
                    "instance {} exceeded {} steps in one signal, likely a loop without a wait",
                    instance.id, self.config.max_steps_per_signal
                )));
            }
            budget -= 1;

            let spec = step(definition, &step_id)?;
            debug!(instance_id = %instance.id, step_id = %step_id, "entering step");
            instance.record_event(Box::new(StepEntered {
                instance_id: instance.id.clone(),
                step_id: step_id.clone(),
                timestamp: Utc::now(),
            }));

            match &spec.kind {
                StepKind::End => {
                    instance.record_history(&step_id, "reached end");
                    if instance.positions.is_empty() && worklist.is_empty() {
                        instance.complete()?;
                        instance.record_event(Box::new(InstanceCompleted {
                            instance_id: instance.id.clone(),
                            timestamp: Utc::now(),
                        }));
                        info!(instance_id = %instance.id, "process completed");
                    }
                }

                StepKind::Task { assignee, due } => {
                    let token = PositionToken::new_random();
                    let due_at = match due {
                        Some(d) => Some(Utc::now() + to_chrono(*d)?),
                        None => None,
                    };
                    let task = Task::new(instance.id.clone(), &step_id, token.clone(), assignee, due_at);
                    instance.add_position_with_token(
                        token.clone(),
                        &step_id,
                        WaitKind::Task {
                            task_id: task.id.clone(),
                        },
                    );
                    if let Some(due_at) = due_at {
                        let timer = TimerSubscription::new(
                            instance.id.clone(),
                            token,
                            TimerPurpose::TaskDeadline {
                                task_id: task.id.clone(),
                            },
                            due_at,
                        );
                        instance.record_event(Box::new(TimerScheduled {
                            instance_id: instance.id.clone(),
                            timer_id: timer.id.clone(),
                            step_id: step_id.clone(),
                            fire_at: due_at,
                            timestamp: Utc::now(),
                        }));
                        effects.timers.push(timer);
                    }
                    instance.record_event(Box::new(TaskOpened {
                        instance_id: instance.id.clone(),
                        task_id: task.id.clone(),
                        step_id: step_id.clone(),
                        assignee: assignee.clone(),
                        timestamp: Utc::now(),
                    }));
                    instance.record_history(&step_id, format!("task {} opened for {}", task.id, assignee));
                    effects.tasks.push(task);
                }

                StepKind::Timer { delay } => {
                    let token = PositionToken::new_random();
                    let timer = TimerSubscription::new(
                        instance.id.clone(),
                        token.clone(),
                        TimerPurpose::Delay,
                        Utc::now() + to_chrono(*delay)?,
                    );
                    instance.add_position_with_token(
                        token,
                        &step_id,
                        WaitKind::Timer {
                            timer_id: timer.id.clone(),
                        },
                    );
                    instance.record_event(Box::new(TimerScheduled {
                        instance_id: instance.id.clone(),
                        timer_id: timer.id.clone(),
                        step_id: step_id.clone(),
                        fire_at: timer.fire_at,
                        timestamp: Utc::now(),
                    }));
                    instance.record_history(&step_id, "timer scheduled");
                    effects.timers.push(timer);
                }

                StepKind::Event {
                    name,
                    correlation_key,
                } => {
                    let correlation = match instance.variables.get(correlation_key) {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => {
                            return Err(EngineError::StepConfigError(format!(
                                "event step {} requires variable {} for correlation",
                                step_id, correlation_key
                            )))
                        }
                    };
                    let token = PositionToken::new_random();
                    instance.add_position_with_token(
                        token.clone(),
                        &step_id,
                        WaitKind::Event {
                            name: name.clone(),
                            correlation: correlation.clone(),
                        },
                    );
                    instance.record_history(&step_id, format!("waiting for event {}", name));
                    effects.register_waits.push((
                        name.clone(),
                        correlation,
                        EventWait {
                            instance_id: instance.id.clone(),
                            token,
                        },
                    ));
                }

                StepKind::Gateway(GatewayKind::Exclusive { default }) => {
                    let matched = self.first_matching(&spec, EdgeTrigger::Completed, instance)?;
                    let target = match matched.or_else(|| default.clone()) {
                        Some(target) => target,
                        None => {
                            return Err(EngineError::StepConfigError(format!(
                                "gateway {} matched no edge and has no default",
                                step_id
                            )))
                        }
                    };
                    instance.record_history(&step_id, format!("routed to {}", target));
                    worklist.push_back((target, branch));
                }

                StepKind::Gateway(GatewayKind::Parallel) => {
                    let mut taken = Vec::new();
                    for edge in completed_edges(&spec) {
                        let pass = match &edge.guard {
                            Some(guard) => self.guard.evaluate(guard, &instance.variables)?,
                            None => true,
                        };
                        if pass {
                            taken.push(edge.target.clone());
                        }
                    }
                    if taken.is_empty() {
                        return Err(EngineError::StepConfigError(format!(
                            "parallel gateway {} took no branch",
                            step_id
                        )));
                    }
                    instance.record_history(&step_id, format!("split into {} branches", taken.len()));
                    for target in taken {
                        worklist.push_back((target, PositionToken::new_random()));
                    }
                }

                StepKind::Gateway(GatewayKind::Join { branches }) => {
                    let arrivals = instance.record_join_arrival(&step_id, &branch);
                    if arrivals >= *branches {
                        if let Some(parked) = instance
                            .positions
                            .iter()
                            .find(|p| p.step_id == step_id && p.wait == WaitKind::Join)
                            .map(|p| p.token.clone())
                        {
                            instance.remove_position(&parked);
                        }
                        instance.clear_join(&step_id);
                        instance.record_history(&step_id, format!("join fired after {} arrivals", arrivals));
                        let next = self.route(&spec, EdgeTrigger::Completed, instance)?;
                        worklist.push_back((next, branch));
                    } else {
                        let has_parked = instance
                            .positions
                            .iter()
                            .any(|p| p.step_id == step_id && p.wait == WaitKind::Join);
                        if !has_parked {
                            instance.add_position(&step_id, WaitKind::Join);
                        }
                        instance.record_history(
                            &step_id,
                            format!("join holding at {}/{} arrivals", arrivals, branches),
                        );
                    }
                }

                StepKind::Automatic { action, config } => {
                    let payload = self.run_automatic(instance, &step_id, action, config).await?;
                    self.merge_payload(instance, &step_id, &payload);
                    instance.record_history(&step_id, format!("action {} succeeded", action));
                    let next = self.route(&spec, EdgeTrigger::Completed, instance)?;
                    worklist.push_back((next, branch));
                }
            }
        }
        Ok(())
    }

    /// Run an automatic step's collaborator with bounded exponential
    /// backoff.
    async fn run_automatic(
        &self,
        instance: &ProcessInstance,
        step_id: &str,
        action: &str,
        config: &Value,
    ) -> Result<Payload, EngineError> {
        let Some(handler) = self.actions.get(action) else {
            return Err(EngineError::StepConfigError(format!(
                "step {} references unregistered action {}",
                step_id, action
            )));
        };

        let mut last_error = None;
        for attempt in 1..=self.config.automatic_attempts {
            match handler.execute(config, &instance.variables).await {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        step_id = %step_id,
                        action = %action,
                        attempt,
                        error = %e,
                        "automatic action failed"
                    );
                    last_error = Some(e);
                    if attempt < self.config.automatic_attempts {
                        tokio::time::sleep(backoff_delay(
                            self.config.automatic_retry_base,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }

        Err(EngineError::CollaboratorError(format!(
            "action {} at step {} failed after {} attempts: {}",
            action,
            step_id,
            self.config.automatic_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// First matching completed-trigger edge, or an error when none match.
    fn route(
        &self,
        spec: &StepSpec,
        trigger: EdgeTrigger,
        instance: &ProcessInstance,
    ) -> Result<String, EngineError> {
        match self.first_matching(spec, trigger, instance)? {
            Some(target) => Ok(target),
            None => Err(EngineError::StepConfigError(format!(
                "step {} has no matching outgoing edge",
                spec.id
            ))),
        }
    }

    fn first_matching(
        &self,
        spec: &StepSpec,
        trigger: EdgeTrigger,
        instance: &ProcessInstance,
    ) -> Result<Option<String>, EngineError> {
        for edge in spec.edges.iter().filter(|e| e.trigger == trigger) {
            let pass = match &edge.guard {
                Some(guard) => self.guard.evaluate(guard, &instance.variables)?,
                None => true,
            };
            if pass {
                return Ok(Some(edge.target.clone()));
            }
        }
        Ok(None)
    }

    /// Merge a payload into the variable bag. Objects merge key-wise;
    /// other non-null values land under the step id.
    fn merge_payload(&self, instance: &mut ProcessInstance, step_id: &str, payload: &Payload) {
        match &payload.value {
            Value::Object(map) => instance.variables.merge(map.clone()),
            Value::Null => {}
            other => instance.variables.set(step_id, other.clone()),
        }
    }

    /// Close open tasks, pending timers, and event waits when an instance
    /// terminates.
    async fn close_out_waits(
        &self,
        instance: &ProcessInstance,
        effects: &mut SideEffects,
    ) -> Result<(), EngineError> {
        for mut task in self.repos.tasks.list_for_instance(&instance.id).await? {
            if task.cancel()? {
                effects.tasks.push(task);
            }
        }
        for mut timer in self
            .repos
            .timers
            .list_pending_for_instance(&instance.id)
            .await?
        {
            if timer.cancel() {
                effects.timers.push(timer);
            }
        }
        for position in &instance.positions {
            if let WaitKind::Event { name, correlation } = &position.wait {
                effects.remove_waits.push((
                    name.clone(),
                    correlation.clone(),
                    position.token.clone(),
                ));
            }
        }
        Ok(())
    }

    async fn cancel_deadline_timers(
        &self,
        instance: &ProcessInstance,
        task_id: &TaskId,
        effects: &mut SideEffects,
    ) -> Result<(), EngineError> {
        for mut timer in self
            .repos
            .timers
            .list_pending_for_instance(&instance.id)
            .await?
        {
            if matches!(&timer.purpose, TimerPurpose::TaskDeadline { task_id: t } if t == task_id)
                && timer.cancel()
            {
                effects.timers.push(timer);
            }
        }
        Ok(())
    }

    /// Fail the instance with a contained error, closing out its waits.
    async fn contain_failure(
        &self,
        instance: &mut ProcessInstance,
        effects: &mut SideEffects,
        error: EngineError,
    ) -> Result<(), EngineError> {
        warn!(instance_id = %instance.id, error = %error, "instance failed");
        // Effects staged before the failure are discarded with the
        // positions they belonged to.
        *effects = SideEffects::default();
        self.close_out_waits(instance, effects).await?;
        instance.fail(error.to_string())?;
        instance.record_event(Box::new(InstanceFailed {
            instance_id: instance.id.clone(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    async fn apply_effects(&self, effects: SideEffects) -> Result<(), EngineError> {
        for task in &effects.tasks {
            self.repos.tasks.save(task).await?;
        }
        for timer in &effects.timers {
            self.repos.timers.save(timer).await?;
        }
        for (event, correlation, wait) in effects.register_waits {
            self.repos
                .correlations
                .register(&event, &correlation, wait)
                .await?;
        }
        for (event, correlation, token) in effects.remove_waits {
            self.repos
                .correlations
                .remove(&event, &correlation, &token)
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, events: Vec<Box<dyn DomainEvent>>) {
        for event in events {
            for handler in &self.handlers {
                if let Err(e) = handler.handle(event.as_ref()).await {
                    warn!(
                        event_type = event.event_type(),
                        instance_id = %event.instance_id(),
                        error = %e,
                        "event handler failed"
                    );
                }
            }
        }
    }
}

fn step(definition: &ProcessDefinition, step_id: &str) -> Result<StepSpec, EngineError> {
    definition.step(step_id).cloned().ok_or_else(|| {
        EngineError::StepConfigError(format!(
            "definition {} v{} has no step {}",
            definition.name, definition.version, step_id
        ))
    })
}

fn completed_edges(spec: &StepSpec) -> impl Iterator<Item = &crate::domain::definition::Edge> {
    spec.edges
        .iter()
        .filter(|e| e.trigger == EdgeTrigger::Completed)
}

fn to_chrono(d: std::time::Duration) -> Result<chrono::Duration, EngineError> {
    chrono::Duration::from_std(d)
        .map_err(|e| EngineError::StepConfigError(format!("duration out of range: {}", e)))
}

/// Exponential backoff before retry `attempt` (1-based), saturating so
/// large configured attempt counts never overflow.
fn backoff_delay(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}
