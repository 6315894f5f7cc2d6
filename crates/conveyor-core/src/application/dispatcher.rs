//! Per-instance signal lanes.
//!
//! Every instance gets one mpsc lane with a single worker task draining
//! it, so signals for a given instance are applied one at a time in
//! arrival order. Signals for different instances run concurrently.

use crate::application::execution::{ExecutionService, StepSignal};
use crate::domain::instance::{InstanceId, ProcessInstance};
use crate::EngineError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

struct Envelope {
    instance_id: InstanceId,
    signal: StepSignal,
    reply: Option<oneshot::Sender<Result<ProcessInstance, EngineError>>>,
}

/// Routes signals onto per-instance lanes
pub struct Dispatcher {
    execution: Arc<ExecutionService>,
    lanes: DashMap<String, mpsc::Sender<Envelope>>,
    lane_buffer: usize,
    healthy: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Create a dispatcher over an execution service
    pub fn new(execution: Arc<ExecutionService>, lane_buffer: usize) -> Self {
        Self {
            execution,
            lanes: DashMap::new(),
            lane_buffer,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the engine has hit an unrecoverable store failure. Hosts
    /// poll this for liveness; an unhealthy dispatcher rejects signals.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Apply a signal and wait for its outcome
    pub async fn signal(
        &self,
        instance_id: &InstanceId,
        signal: StepSignal,
    ) -> Result<ProcessInstance, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(instance_id, signal, Some(tx)).await?;
        rx.await.map_err(|_| {
            EngineError::StoreError(format!(
                "lane for instance {} dropped the signal",
                instance_id
            ))
        })?
    }

    /// Apply a signal without waiting for its outcome, used by the timer
    /// scan loop
    pub async fn signal_detached(
        &self,
        instance_id: &InstanceId,
        signal: StepSignal,
    ) -> Result<(), EngineError> {
        self.enqueue(instance_id, signal, None).await
    }

    async fn enqueue(
        &self,
        instance_id: &InstanceId,
        signal: StepSignal,
        reply: Option<oneshot::Sender<Result<ProcessInstance, EngineError>>>,
    ) -> Result<(), EngineError> {
        if !self.is_healthy() {
            return Err(EngineError::StoreError(
                "engine is unhealthy after a store failure".to_string(),
            ));
        }

        let envelope = Envelope {
            instance_id: instance_id.clone(),
            signal,
            reply,
        };
        let sender = self.lane(instance_id);
        if let Err(rejected) = sender.send(envelope).await {
            // The worker exited since we fetched the sender; rebuild the
            // lane once and retry.
            self.lanes.remove(&instance_id.0);
            let sender = self.lane(instance_id);
            sender.send(rejected.0).await.map_err(|_| {
                EngineError::StoreError(format!(
                    "lane for instance {} is not accepting signals",
                    instance_id
                ))
            })?;
        }
        Ok(())
    }

    fn lane(&self, instance_id: &InstanceId) -> mpsc::Sender<Envelope> {
        self.lanes
            .entry(instance_id.0.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.lane_buffer);
                let execution = Arc::clone(&self.execution);
                let healthy = Arc::clone(&self.healthy);
                tokio::spawn(lane_worker(execution, healthy, rx));
                tx
            })
            .clone()
    }

    /// Drop all lanes; their workers exit after draining in-flight
    /// signals.
    pub fn shutdown(&self) {
        self.lanes.clear();
    }
}

async fn lane_worker(
    execution: Arc<ExecutionService>,
    healthy: Arc<AtomicBool>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let result = execution
            .apply(&envelope.instance_id, envelope.signal)
            .await;

        let fatal = matches!(result, Err(EngineError::StoreError(_)));
        if fatal {
            error!(
                instance_id = %envelope.instance_id,
                error = %result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
                "store failure, marking engine unhealthy"
            );
            healthy.store(false, Ordering::SeqCst);
        } else if let Err(e) = &result {
            debug!(instance_id = %envelope.instance_id, error = %e, "signal rejected");
        }

        if let Some(reply) = envelope.reply {
            if reply.send(result).is_err() {
                warn!(instance_id = %envelope.instance_id, "signal caller went away before the result");
            }
        }

        if fatal {
            return;
        }
    }
}
