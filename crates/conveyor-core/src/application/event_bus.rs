//! Timer delivery and external event intake.
//!
//! A single scan loop polls the timer store for due subscriptions and
//! pushes them onto the owning instances' lanes. Timers are delivered
//! at-least-once: a subscription keeps showing up as due until the engine
//! marks it fired, and the engine absorbs duplicates.
//!
//! External events are matched against registered waits. An event that
//! matches nothing is held in a replay buffer and retried each scan tick,
//! because the publisher may simply have raced the instance reaching its
//! wait point; past the replay window it is dropped. A wait on a
//! suspended instance defers the event, so it stays buffered until the
//! instance resumes or the window lapses.

use crate::application::dispatcher::Dispatcher;
use crate::application::execution::{ExecutionService, StepSignal};
use crate::application::EngineConfig;
use crate::domain::definition::TriggerSpec;
use crate::domain::instance::InstanceId;
use crate::domain::repository::Repositories;
use crate::types::{Payload, VariableBag};
use crate::EngineError;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What publishing an external event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered to this many waiting positions
    Matched(usize),
    /// Instantiated an event-triggered definition
    Started(InstanceId),
    /// Nothing matched yet; held for replay
    Buffered,
}

struct PendingEvent {
    name: String,
    correlation: String,
    payload: Payload,
    expires_at: DateTime<Utc>,
}

/// Durable timer delivery and external event routing
pub struct EventBus {
    repos: Repositories,
    dispatcher: Arc<Dispatcher>,
    execution: Arc<ExecutionService>,
    config: Arc<EngineConfig>,
    replay: Mutex<VecDeque<PendingEvent>>,
}

impl EventBus {
    /// Create a bus over the given stores and dispatcher
    pub fn new(
        repos: Repositories,
        dispatcher: Arc<Dispatcher>,
        execution: Arc<ExecutionService>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repos,
            dispatcher,
            execution,
            config,
            replay: Mutex::new(VecDeque::new()),
        }
    }

    /// Spawn the scan loop. It runs until `stop` observes `true`.
    pub fn start(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(bus.config.timer_scan_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        bus.tick().await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            debug!("timer scan loop stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// One scan pass: deliver due timers, then retry buffered events.
    async fn tick(&self) {
        match self.repos.timers.due(Utc::now()).await {
            Ok(due) => {
                for timer in due {
                    let signal = StepSignal::TimerFired {
                        timer_id: timer.id.clone(),
                    };
                    if let Err(e) = self
                        .dispatcher
                        .signal_detached(&timer.instance_id, signal)
                        .await
                    {
                        warn!(timer_id = %timer.id, error = %e, "timer delivery failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "timer scan failed"),
        }

        self.retry_buffered().await;
    }

    /// Route an external event. Matches registered waits first, then
    /// event-triggered definitions, and buffers otherwise.
    pub async fn publish(
        &self,
        name: &str,
        correlation: &str,
        payload: Payload,
    ) -> Result<PublishOutcome, EngineError> {
        if let Some(outcome) = self.try_deliver(name, correlation, &payload).await? {
            return Ok(outcome);
        }

        self.buffer_event(PendingEvent {
            name: name.to_string(),
            correlation: correlation.to_string(),
            payload,
            expires_at: self.replay_expiry()?,
        });
        debug!(event = name, correlation, "event unmatched, buffered for replay");
        Ok(PublishOutcome::Buffered)
    }

    async fn try_deliver(
        &self,
        name: &str,
        correlation: &str,
        payload: &Payload,
    ) -> Result<Option<PublishOutcome>, EngineError> {
        let waits = self.repos.correlations.find(name, correlation).await?;
        if !waits.is_empty() {
            let total = waits.len();
            let deliveries = waits.into_iter().map(|wait| {
                let instance_id = wait.instance_id;
                let token = wait.token;
                let signal = StepSignal::EventMatched {
                    token: token.clone(),
                    payload: payload.clone(),
                };
                // The wait was consumed when its position is gone
                // afterwards; a suspended instance leaves it parked.
                async move {
                    match self.dispatcher.signal(&instance_id, signal).await {
                        Ok(instance) => instance.position(&token).is_none(),
                        Err(e) => {
                            warn!(instance_id = %instance_id, error = %e, "event delivery failed");
                            false
                        }
                    }
                }
            });
            let delivered = futures::future::join_all(deliveries)
                .await
                .into_iter()
                .filter(|consumed| *consumed)
                .count();

            if delivered == 0 {
                // Every matched wait deferred; hold the event for replay.
                return Ok(None);
            }
            if delivered < total {
                self.buffer_event(PendingEvent {
                    name: name.to_string(),
                    correlation: correlation.to_string(),
                    payload: payload.clone(),
                    expires_at: self.replay_expiry()?,
                });
            }
            debug!(event = name, correlation, delivered, "event delivered to waits");
            return Ok(Some(PublishOutcome::Matched(delivered)));
        }

        if let Some(definition) = self.event_triggered_definition(name).await? {
            let mut variables = VariableBag::from(payload.value.clone());
            variables.set("correlation_id", serde_json::Value::String(correlation.to_string()));
            let instance = self.execution.instantiate(&definition, variables).await?;
            info!(
                event = name,
                correlation,
                instance_id = %instance.id,
                definition = %definition.name,
                "event instantiated definition"
            );
            return Ok(Some(PublishOutcome::Started(instance.id)));
        }

        Ok(None)
    }

    async fn event_triggered_definition(
        &self,
        event: &str,
    ) -> Result<Option<crate::domain::definition::ProcessDefinition>, EngineError> {
        for name in self.repos.definitions.list_names().await? {
            if let Some(definition) = self.repos.definitions.find_active(&name).await? {
                if matches!(&definition.trigger, TriggerSpec::Event { name } if name == event) {
                    return Ok(Some(definition));
                }
            }
        }
        Ok(None)
    }

    async fn retry_buffered(&self) {
        let pending = {
            let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *replay)
        };
        if pending.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut keep = VecDeque::new();
        for event in pending {
            match self
                .try_deliver(&event.name, &event.correlation, &event.payload)
                .await
            {
                Ok(Some(_)) => {
                    debug!(event = %event.name, correlation = %event.correlation, "buffered event delivered");
                }
                Ok(None) => {
                    if event.expires_at <= now {
                        warn!(
                            event = %event.name,
                            correlation = %event.correlation,
                            "event left the replay window unmatched, dropped"
                        );
                    } else {
                        keep.push_back(event);
                    }
                }
                Err(e) => {
                    warn!(event = %event.name, error = %e, "buffered event delivery failed");
                    keep.push_back(event);
                }
            }
        }

        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        // Events published while we were retrying landed in the buffer
        // already; keep them behind the retried ones.
        for event in replay.drain(..) {
            keep.push_back(event);
        }
        *replay = keep;
    }

    fn buffer_event(&self, event: PendingEvent) {
        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        replay.push_back(event);
    }

    fn replay_expiry(&self) -> Result<DateTime<Utc>, EngineError> {
        let window = chrono::Duration::from_std(self.config.event_replay_window)
            .map_err(|e| EngineError::TimerError(e.to_string()))?;
        Ok(Utc::now() + window)
    }
}
