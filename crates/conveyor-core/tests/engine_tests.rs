//! End-to-end engine tests over the in-memory repositories.

use async_trait::async_trait;
use conveyor_core::domain::repository::memory;
use conveyor_core::{
    AutomaticAction, DefinitionName, DomainEvent, Edge, EngineConfig, EngineError,
    EngineEventHandler, GatewayKind, InstanceStatus, Payload, ProcessDefinition, ProcessRuntime,
    PublishOutcome, StepKind, StepSpec, TaskStatus, TriggerSpec, VariableBag,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        timer_scan_interval: Duration::from_millis(20),
        automatic_retry_base: Duration::from_millis(2),
        event_replay_window: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

/// Poll a condition until it holds or two seconds pass.
async fn eventually<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn draft(name: &str, start: &str, steps: Vec<StepSpec>) -> ProcessDefinition {
    ProcessDefinition {
        name: DefinitionName(name.to_string()),
        version: 0,
        description: None,
        start: start.to_string(),
        steps,
        trigger: TriggerSpec::Manual,
        active: false,
    }
}

fn task_step(id: &str, assignee: &str, due: Option<Duration>, edges: Vec<Edge>) -> StepSpec {
    StepSpec {
        id: id.to_string(),
        kind: StepKind::Task {
            assignee: assignee.to_string(),
            due,
        },
        edges,
    }
}

fn auto_step(id: &str, action: &str, edges: Vec<Edge>) -> StepSpec {
    StepSpec {
        id: id.to_string(),
        kind: StepKind::Automatic {
            action: action.to_string(),
            config: json!({}),
        },
        edges,
    }
}

fn end_step(id: &str) -> StepSpec {
    StepSpec {
        id: id.to_string(),
        kind: StepKind::End,
        edges: vec![],
    }
}

fn vars(value: Value) -> VariableBag {
    VariableBag::from(value)
}

/// Merges a fixed object into the variables
struct SetVars(Value);

#[async_trait]
impl AutomaticAction for SetVars {
    async fn execute(
        &self,
        _config: &Value,
        _variables: &VariableBag,
    ) -> Result<Payload, EngineError> {
        Ok(Payload::new(self.0.clone()))
    }
}

/// Fails a fixed number of times before succeeding
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl AutomaticAction for Flaky {
    async fn execute(
        &self,
        _config: &Value,
        _variables: &VariableBag,
    ) -> Result<Payload, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(EngineError::CollaboratorError("connection refused".to_string()))
        } else {
            Ok(Payload::null())
        }
    }
}

/// Records event types in arrival order
struct Recorder(Mutex<Vec<String>>);

#[async_trait]
impl EngineEventHandler for Recorder {
    async fn handle(&self, event: &dyn DomainEvent) -> Result<(), EngineError> {
        self.0
            .lock()
            .unwrap()
            .push(event.event_type().to_string());
        Ok(())
    }
}

fn runtime() -> Arc<ProcessRuntime> {
    init_tracing();
    ProcessRuntime::builder(memory::repositories())
        .config(fast_config())
        .action("noop", Arc::new(SetVars(json!({}))))
        .action("mark_escalated", Arc::new(SetVars(json!({"escalated": true}))))
        .build()
}

#[tokio::test]
async fn test_linear_task_flow_completes() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "expense",
            "review",
            vec![
                task_step("review", "officer", None, vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();

    let instance = rt
        .instantiate(&reference.name, None, vars(json!({"amount": 120})))
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);

    let open = rt.tasks_for_assignee("officer").await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].step_id, "review");

    let done = rt
        .complete_task(&open[0].id, "alice", Payload::new(json!({"decision": "approve"})))
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables.get("decision"), Some(&json!("approve")));
    assert_eq!(done.variables.get("amount"), Some(&json!(120)));
    assert!(rt.tasks_for_assignee("officer").await.unwrap().is_empty());

    let tasks = rt.tasks_for_instance(&instance.id).await.unwrap();
    assert_eq!(tasks[0].completed_by.as_deref(), Some("alice"));
    rt.shutdown();
}

#[tokio::test]
async fn test_duplicate_completion_is_absorbed() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "expense",
            "review",
            vec![
                task_step("review", "officer", None, vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let task = &rt.tasks_for_instance(&instance.id).await.unwrap()[0];
    let first = rt
        .complete_task(&task.id, "alice", Payload::new(json!({"decision": "approve"})))
        .await
        .unwrap();
    assert_eq!(first.status, InstanceStatus::Completed);

    // A retried submission reports the settled state instead of an error.
    let second = rt
        .complete_task(&task.id, "bob", Payload::new(json!({"decision": "reject"})))
        .await
        .unwrap();
    assert_eq!(second.status, InstanceStatus::Completed);
    assert_eq!(second.variables.get("decision"), Some(&json!("approve")));

    // The original completer stays on record.
    let tasks = rt.tasks_for_instance(&instance.id).await.unwrap();
    assert_eq!(tasks[0].completed_by.as_deref(), Some("alice"));
    rt.shutdown();
}

#[tokio::test]
async fn test_task_deadline_escalates() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step(
                    "review",
                    "officer",
                    Some(Duration::from_millis(50)),
                    vec![Edge::to("done"), Edge::on_expiry("escalate")],
                ),
                auto_step("escalate", "mark_escalated", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let id = instance.id.clone();
    eventually(
        || async {
            rt.instance(&id).await.unwrap().status == InstanceStatus::Completed
        },
        "escalation to complete the instance",
    )
    .await;

    let done = rt.instance(&instance.id).await.unwrap();
    assert_eq!(done.variables.get("escalated"), Some(&json!(true)));
    let tasks = rt.tasks_for_instance(&instance.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Expired);

    // Completing the expired task is a stale signal.
    let err = rt
        .complete_task(&tasks[0].id, "officer", Payload::null())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyTerminal(_)));
    rt.shutdown();
}

#[tokio::test]
async fn test_expiry_without_route_fails_instance() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step(
                    "review",
                    "officer",
                    Some(Duration::from_millis(40)),
                    vec![Edge::to("done")],
                ),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let id = instance.id.clone();
    eventually(
        || async { rt.instance(&id).await.unwrap().status == InstanceStatus::Failed },
        "instance to fail on unrouted expiry",
    )
    .await;

    let failed = rt.instance(&instance.id).await.unwrap();
    assert!(failed.failure.as_deref().unwrap().contains("expiry"));
    assert!(failed.positions.is_empty());
    rt.shutdown();
}

#[tokio::test]
async fn test_exclusive_gateway_routes_by_guard() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "claims",
            "triage",
            vec![
                StepSpec {
                    id: "triage".to_string(),
                    kind: StepKind::Gateway(GatewayKind::Exclusive { default: None }),
                    edges: vec![
                        Edge::guarded("senior_review", "vars.amount > `1000`"),
                        Edge::guarded("auto_approve", "vars.amount <= `1000`"),
                    ],
                },
                task_step("senior_review", "senior", None, vec![Edge::to("done")]),
                auto_step("auto_approve", "noop", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();

    let small = rt
        .instantiate(&reference.name, None, vars(json!({"amount": 200})))
        .await
        .unwrap();
    assert_eq!(small.status, InstanceStatus::Completed);

    let large = rt
        .instantiate(&reference.name, None, vars(json!({"amount": 5000})))
        .await
        .unwrap();
    assert_eq!(large.status, InstanceStatus::Running);
    assert_eq!(large.positions[0].step_id, "senior_review");
    rt.shutdown();
}

#[tokio::test]
async fn test_exclusive_gateway_without_match_fails() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "claims",
            "triage",
            vec![
                StepSpec {
                    id: "triage".to_string(),
                    kind: StepKind::Gateway(GatewayKind::Exclusive { default: None }),
                    edges: vec![Edge::guarded("done", "vars.approved == `true`")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();

    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.failure.as_deref().unwrap().contains("no default"));
    rt.shutdown();
}

#[tokio::test]
async fn test_exclusive_gateway_falls_back_to_default() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "claims",
            "triage",
            vec![
                StepSpec {
                    id: "triage".to_string(),
                    kind: StepKind::Gateway(GatewayKind::Exclusive {
                        default: Some("fallback".to_string()),
                    }),
                    edges: vec![Edge::guarded("done", "vars.approved == `true`")],
                },
                task_step("fallback", "officer", None, vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();

    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.positions[0].step_id, "fallback");
    rt.shutdown();
}

#[tokio::test]
async fn test_parallel_split_and_join() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "onboarding",
            "split",
            vec![
                StepSpec {
                    id: "split".to_string(),
                    kind: StepKind::Gateway(GatewayKind::Parallel),
                    edges: vec![Edge::to("hr_check"), Edge::to("it_setup")],
                },
                task_step("hr_check", "hr", None, vec![Edge::to("merge")]),
                task_step("it_setup", "it", None, vec![Edge::to("merge")]),
                StepSpec {
                    id: "merge".to_string(),
                    kind: StepKind::Gateway(GatewayKind::Join { branches: 2 }),
                    edges: vec![Edge::to("done")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();

    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();
    assert_eq!(instance.positions.len(), 2);

    let hr_task = &rt.tasks_for_assignee("hr").await.unwrap()[0];
    let after_first = rt
        .complete_task(&hr_task.id, "hr-lead", Payload::null())
        .await
        .unwrap();
    assert_eq!(after_first.status, InstanceStatus::Running);
    // One branch done, the join is holding alongside the second task.
    assert!(after_first.positions.iter().any(|p| p.step_id == "merge"));
    assert!(after_first.positions.iter().any(|p| p.step_id == "it_setup"));

    let it_task = &rt.tasks_for_assignee("it").await.unwrap()[0];
    let after_second = rt
        .complete_task(&it_task.id, "it-lead", Payload::null())
        .await
        .unwrap();
    assert_eq!(after_second.status, InstanceStatus::Completed);
    assert!(after_second.positions.is_empty());
    rt.shutdown();
}

#[tokio::test]
async fn test_cancel_closes_open_work() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step(
                    "review",
                    "officer",
                    Some(Duration::from_secs(3600)),
                    vec![Edge::to("done"), Edge::on_expiry("done")],
                ),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let cancelled = rt.cancel(&instance.id, "request withdrawn").await.unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert_eq!(cancelled.cancellation.as_deref(), Some("request withdrawn"));
    assert!(cancelled.positions.is_empty());

    let tasks = rt.tasks_for_instance(&instance.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Cancelled);
    assert!(rt.tasks_for_assignee("officer").await.unwrap().is_empty());

    let err = rt
        .complete_task(&tasks[0].id, "officer", Payload::null())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyTerminal(_)));
    rt.shutdown();
}

#[tokio::test]
async fn test_timer_step_resumes_after_delay() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "cooldown",
            "wait",
            vec![
                StepSpec {
                    id: "wait".to_string(),
                    kind: StepKind::Timer {
                        delay: Duration::from_millis(50),
                    },
                    edges: vec![Edge::to("done")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);

    let id = instance.id.clone();
    eventually(
        || async { rt.instance(&id).await.unwrap().status == InstanceStatus::Completed },
        "timer to resume the instance",
    )
    .await;
    rt.shutdown();
}

#[tokio::test]
async fn test_loop_reentry_opens_fresh_task() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step("review", "officer", None, vec![Edge::to("route")]),
                StepSpec {
                    id: "route".to_string(),
                    kind: StepKind::Gateway(GatewayKind::Exclusive {
                        default: Some("review".to_string()),
                    }),
                    edges: vec![Edge::guarded("done", "vars.decision == 'approve'")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let first = rt.tasks_for_assignee("officer").await.unwrap()[0].clone();
    let looped = rt
        .complete_task(&first.id, "officer", Payload::new(json!({"decision": "rework"})))
        .await
        .unwrap();
    assert_eq!(looped.status, InstanceStatus::Running);

    // The loop re-entered the step as a brand new task under a new token.
    let second = rt.tasks_for_assignee("officer").await.unwrap()[0].clone();
    assert_ne!(first.id, second.id);
    assert_ne!(first.token, second.token);

    let done = rt
        .complete_task(&second.id, "officer", Payload::new(json!({"decision": "approve"})))
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(rt.instance(&instance.id).await.unwrap().status, InstanceStatus::Completed);
    rt.shutdown();
}

#[tokio::test]
async fn test_event_wait_resumes_on_match() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "fulfillment",
            "await_payment",
            vec![
                StepSpec {
                    id: "await_payment".to_string(),
                    kind: StepKind::Event {
                        name: "payment.received".to_string(),
                        correlation_key: "order_id".to_string(),
                    },
                    edges: vec![Edge::to("done")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, vars(json!({"order_id": "o-42"})))
        .await
        .unwrap();
    assert_eq!(instance.positions[0].step_id, "await_payment");

    // Wrong correlation does not match this instance.
    let outcome = rt
        .publish_event("payment.received", "o-99", Payload::null())
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Buffered);

    let outcome = rt
        .publish_event(
            "payment.received",
            "o-42",
            Payload::new(json!({"paid": true})),
        )
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Matched(1));

    let id = instance.id.clone();
    eventually(
        || async { rt.instance(&id).await.unwrap().status == InstanceStatus::Completed },
        "event to complete the instance",
    )
    .await;
    assert_eq!(
        rt.instance(&instance.id).await.unwrap().variables.get("paid"),
        Some(&json!(true))
    );
    rt.shutdown();
}

#[tokio::test]
async fn test_unmatched_event_is_replayed() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "fulfillment",
            "await_payment",
            vec![
                StepSpec {
                    id: "await_payment".to_string(),
                    kind: StepKind::Event {
                        name: "payment.received".to_string(),
                        correlation_key: "order_id".to_string(),
                    },
                    edges: vec![Edge::to("done")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();

    // The publisher races ahead of the instance reaching its wait point.
    let outcome = rt
        .publish_event("payment.received", "o-7", Payload::null())
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Buffered);

    let instance = rt
        .instantiate(&reference.name, None, vars(json!({"order_id": "o-7"})))
        .await
        .unwrap();

    let id = instance.id.clone();
    eventually(
        || async { rt.instance(&id).await.unwrap().status == InstanceStatus::Completed },
        "buffered event to be replayed",
    )
    .await;
    rt.shutdown();
}

#[tokio::test]
async fn test_event_trigger_starts_instance() {
    let rt = runtime();
    let mut definition = draft(
        "orders",
        "record",
        vec![
            auto_step("record", "noop", vec![Edge::to("done")]),
            end_step("done"),
        ],
    );
    definition.trigger = TriggerSpec::Event {
        name: "order.created".to_string(),
    };
    rt.publish_definition(definition).await.unwrap();

    let outcome = rt
        .publish_event("order.created", "o-1", Payload::new(json!({"sku": "X"})))
        .await
        .unwrap();
    let PublishOutcome::Started(instance_id) = outcome else {
        panic!("expected an instantiation, got {:?}", outcome);
    };

    let instance = rt.instance(&instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables.get("sku"), Some(&json!("X")));
    assert_eq!(instance.variables.get("correlation_id"), Some(&json!("o-1")));
    rt.shutdown();
}

#[tokio::test]
async fn test_suspend_blocks_completion_until_resume() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step("review", "officer", None, vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let suspended = rt.suspend(&instance.id).await.unwrap();
    assert_eq!(suspended.status, InstanceStatus::Suspended);

    let task = rt.tasks_for_assignee("officer").await.unwrap()[0].clone();
    let err = rt
        .complete_task(&task.id, "officer", Payload::null())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("suspended"));

    rt.resume(&instance.id).await.unwrap();
    let done = rt
        .complete_task(&task.id, "officer", Payload::null())
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    rt.shutdown();
}

#[tokio::test]
async fn test_suspend_defers_timer_delivery() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "cooldown",
            "wait",
            vec![
                StepSpec {
                    id: "wait".to_string(),
                    kind: StepKind::Timer {
                        delay: Duration::from_millis(100),
                    },
                    edges: vec![Edge::to("done")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();
    rt.suspend(&instance.id).await.unwrap();

    // The timer comes due while suspended but must not advance anything.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let held = rt.instance(&instance.id).await.unwrap();
    assert_eq!(held.status, InstanceStatus::Suspended);
    assert_eq!(held.positions.len(), 1);

    rt.resume(&instance.id).await.unwrap();
    let id = instance.id.clone();
    eventually(
        || async { rt.instance(&id).await.unwrap().status == InstanceStatus::Completed },
        "deferred timer after resume",
    )
    .await;
    rt.shutdown();
}

#[tokio::test]
async fn test_suspend_defers_event_delivery() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "fulfillment",
            "await_payment",
            vec![
                StepSpec {
                    id: "await_payment".to_string(),
                    kind: StepKind::Event {
                        name: "payment.received".to_string(),
                        correlation_key: "order_id".to_string(),
                    },
                    edges: vec![Edge::to("done")],
                },
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, vars(json!({"order_id": "o-42"})))
        .await
        .unwrap();
    rt.suspend(&instance.id).await.unwrap();

    // The matching event arrives while suspended: it stays buffered and
    // the wait stays parked instead of being consumed and lost.
    let outcome = rt
        .publish_event(
            "payment.received",
            "o-42",
            Payload::new(json!({"paid": true})),
        )
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Buffered);
    let held = rt.instance(&instance.id).await.unwrap();
    assert_eq!(held.status, InstanceStatus::Suspended);
    assert_eq!(held.positions.len(), 1);

    rt.resume(&instance.id).await.unwrap();
    let id = instance.id.clone();
    eventually(
        || async { rt.instance(&id).await.unwrap().status == InstanceStatus::Completed },
        "buffered event after resume",
    )
    .await;
    assert_eq!(
        rt.instance(&instance.id).await.unwrap().variables.get("paid"),
        Some(&json!(true))
    );
    rt.shutdown();
}

#[tokio::test]
async fn test_automatic_action_retries_then_succeeds() {
    init_tracing();
    let flaky = Arc::new(Flaky {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let rt = ProcessRuntime::builder(memory::repositories())
        .config(fast_config())
        .action("charge", flaky.clone())
        .build();

    let reference = rt
        .publish_definition(draft(
            "billing",
            "charge",
            vec![
                auto_step("charge", "charge", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    rt.shutdown();
}

#[tokio::test]
async fn test_automatic_action_exhausts_and_fails() {
    init_tracing();
    let flaky = Arc::new(Flaky {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let rt = ProcessRuntime::builder(memory::repositories())
        .config(fast_config())
        .action("charge", flaky.clone())
        .build();

    let reference = rt
        .publish_definition(draft(
            "billing",
            "charge",
            vec![
                auto_step("charge", "charge", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.failure.as_deref().unwrap().contains("5 attempts"));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 5);
    rt.shutdown();
}

#[tokio::test]
async fn test_unregistered_action_fails_instance() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "billing",
            "charge",
            vec![
                auto_step("charge", "missing", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.failure.as_deref().unwrap().contains("unregistered"));
    rt.shutdown();
}

#[tokio::test]
async fn test_running_instances_pin_their_version() {
    let rt = runtime();
    let v1 = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step("review", "officer", None, vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let pinned = rt
        .instantiate(&v1.name, None, VariableBag::new())
        .await
        .unwrap();

    // A new version replaces the task with an automatic step.
    let v2 = rt
        .publish_definition(draft(
            "approval",
            "record",
            vec![
                auto_step("record", "noop", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    // The running instance still executes against version 1.
    let task = rt.tasks_for_instance(&pinned.id).await.unwrap()[0].clone();
    let done = rt
        .complete_task(&task.id, "officer", Payload::null())
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.definition.version, 1);

    // New instantiations resolve version 2.
    let fresh = rt
        .instantiate(&v1.name, None, VariableBag::new())
        .await
        .unwrap();
    assert_eq!(fresh.definition.version, 2);
    assert_eq!(fresh.status, InstanceStatus::Completed);
    rt.shutdown();
}

#[tokio::test]
async fn test_force_advance_skips_waiting_task() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step(
                    "review",
                    "officer",
                    Some(Duration::from_secs(3600)),
                    vec![Edge::to("done"), Edge::on_expiry("done")],
                ),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let advanced = rt.force_advance(&instance.id, "review").await.unwrap();
    assert_eq!(advanced.status, InstanceStatus::Completed);

    let tasks = rt.tasks_for_instance(&instance.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].completed_by.as_deref(), Some("operator"));
    assert!(tasks[0].output.as_ref().unwrap().is_null());
    rt.shutdown();
}

#[tokio::test]
async fn test_event_handlers_observe_lifecycle() {
    init_tracing();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let rt = ProcessRuntime::builder(memory::repositories())
        .config(fast_config())
        .action("noop", Arc::new(SetVars(json!({}))))
        .event_handler(recorder.clone())
        .build();

    let reference = rt
        .publish_definition(draft(
            "orders",
            "record",
            vec![
                auto_step("record", "noop", vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    rt.instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let seen = recorder.0.lock().unwrap().clone();
    assert_eq!(seen.first().map(String::as_str), Some("instance.started"));
    assert!(seen.iter().any(|e| e == "step.entered"));
    assert_eq!(seen.last().map(String::as_str), Some("instance.completed"));
    rt.shutdown();
}

#[tokio::test]
async fn test_summary_reports_active_steps() {
    let rt = runtime();
    let reference = rt
        .publish_definition(draft(
            "approval",
            "review",
            vec![
                task_step("review", "officer", None, vec![Edge::to("done")]),
                end_step("done"),
            ],
        ))
        .await
        .unwrap();
    let instance = rt
        .instantiate(&reference.name, None, VariableBag::new())
        .await
        .unwrap();

    let summary = rt.summary(&instance.id).await.unwrap();
    assert_eq!(summary.status, InstanceStatus::Running);
    assert_eq!(summary.active_steps, vec!["review".to_string()]);

    let running = rt.instances_by_status(InstanceStatus::Running).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, instance.id);
    rt.shutdown();
}
