use crate::InMemoryStateStore;
use chrono::{Duration, Utc};
use conveyor_core::domain::repository::EventWait;
use conveyor_core::domain::timer::TimerPurpose;
use conveyor_core::{
    DefinitionName, DefinitionRef, Edge, EngineError, InstanceId, InstanceStatus, Payload,
    PositionToken, ProcessDefinition, ProcessInstance, StepKind, StepSpec, Task, TimerSubscription,
    TriggerSpec, VariableBag,
};

fn definition(name: &str, version: u32, active: bool) -> ProcessDefinition {
    ProcessDefinition {
        name: DefinitionName(name.to_string()),
        version,
        description: None,
        start: "notify".to_string(),
        steps: vec![
            StepSpec {
                id: "notify".to_string(),
                kind: StepKind::Automatic {
                    action: "noop".to_string(),
                    config: serde_json::json!({}),
                },
                edges: vec![Edge::to("done")],
            },
            StepSpec {
                id: "done".to_string(),
                kind: StepKind::End,
                edges: vec![],
            },
        ],
        trigger: TriggerSpec::Manual,
        active,
    }
}

fn instance(name: &str) -> ProcessInstance {
    ProcessInstance::new(
        DefinitionRef {
            name: DefinitionName(name.to_string()),
            version: 1,
        },
        VariableBag::new(),
    )
}

#[tokio::test]
async fn test_definition_version_chain() -> Result<(), EngineError> {
    let store = InMemoryStateStore::new();
    let repos = store.repositories();

    repos.definitions.save(&definition("review", 1, true)).await?;
    repos.definitions.save(&definition("review", 2, true)).await?;
    repos.definitions.save(&definition("review", 3, false)).await?;
    repos.definitions.save(&definition("billing", 1, true)).await?;

    let name = DefinitionName("review".to_string());
    let versions = repos.definitions.list_versions(&name).await?;
    assert_eq!(
        versions.iter().map(|d| d.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let active = repos.definitions.find_active(&name).await?.unwrap();
    assert_eq!(active.version, 2);

    let names = repos.definitions.list_names().await?;
    assert_eq!(
        names,
        vec![
            DefinitionName("billing".to_string()),
            DefinitionName("review".to_string())
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_instance_save_is_compare_and_swap() -> Result<(), EngineError> {
    let store = InMemoryStateStore::new();
    let repos = store.repositories();

    let fresh = instance("review");
    let revision = repos.instances.save(&fresh).await?;
    assert_eq!(revision, 1);

    // Two writers load the same revision; the slower one must lose.
    let mut first = repos.instances.find(&fresh.id).await?.unwrap();
    let mut second = repos.instances.find(&fresh.id).await?.unwrap();
    first.variables.set("winner", serde_json::json!("first"));
    second.variables.set("winner", serde_json::json!("second"));

    assert_eq!(repos.instances.save(&first).await?, 2);
    let err = repos.instances.save(&second).await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrencyConflict(_)));

    let stored = repos.instances.find(&fresh.id).await?.unwrap();
    assert_eq!(
        stored.variables.get("winner"),
        Some(&serde_json::json!("first"))
    );
    Ok(())
}

#[tokio::test]
async fn test_instance_status_listing() -> Result<(), EngineError> {
    let store = InMemoryStateStore::new();
    let repos = store.repositories();

    let running = instance("review");
    let mut cancelled = instance("review");
    cancelled.cancel("operator request")?;
    repos.instances.save(&running).await?;
    repos.instances.save(&cancelled).await?;

    let found = repos.instances.list_by_status(InstanceStatus::Running).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, running.id);

    let by_def = repos
        .instances
        .list_by_definition(&DefinitionName("review".to_string()))
        .await?;
    assert_eq!(by_def.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_task_ledger_queries() -> Result<(), EngineError> {
    let store = InMemoryStateStore::new();
    let repos = store.repositories();

    let instance_id = InstanceId::new_random();
    let mut approve = Task::new(
        instance_id.clone(),
        "approve",
        PositionToken::new_random(),
        "compliance-officer",
        None,
    );
    let review = Task::new(
        instance_id.clone(),
        "review",
        PositionToken::new_random(),
        "compliance-officer",
        None,
    );
    let other = Task::new(
        InstanceId::new_random(),
        "approve",
        PositionToken::new_random(),
        "auditor",
        None,
    );
    repos.tasks.save(&approve).await?;
    repos.tasks.save(&review).await?;
    repos.tasks.save(&other).await?;

    assert_eq!(repos.tasks.list_for_instance(&instance_id).await?.len(), 2);
    assert_eq!(
        repos
            .tasks
            .list_open_for_assignee("compliance-officer")
            .await?
            .len(),
        2
    );

    // Completed tasks drop out of the assignee worklist.
    approve.complete("compliance-officer", Payload::null())?;
    repos.tasks.save(&approve).await?;
    assert_eq!(
        repos
            .tasks
            .list_open_for_assignee("compliance-officer")
            .await?
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_due_timer_query_ordering() -> Result<(), EngineError> {
    let store = InMemoryStateStore::new();
    let repos = store.repositories();
    let now = Utc::now();
    let instance_id = InstanceId::new_random();

    let late = TimerSubscription::new(
        instance_id.clone(),
        PositionToken::new_random(),
        TimerPurpose::Delay,
        now - Duration::seconds(1),
    );
    let early = TimerSubscription::new(
        instance_id.clone(),
        PositionToken::new_random(),
        TimerPurpose::Delay,
        now - Duration::seconds(5),
    );
    let mut cancelled = TimerSubscription::new(
        instance_id.clone(),
        PositionToken::new_random(),
        TimerPurpose::Delay,
        now - Duration::seconds(10),
    );
    cancelled.cancel();
    repos.timers.save(&late).await?;
    repos.timers.save(&early).await?;
    repos.timers.save(&cancelled).await?;

    let due = repos.timers.due(now).await?;
    assert_eq!(
        due.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
        vec![early.id.clone(), late.id.clone()]
    );

    let pending = repos.timers.list_pending_for_instance(&instance_id).await?;
    assert_eq!(pending.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_correlation_index_roundtrip() -> Result<(), EngineError> {
    let store = InMemoryStateStore::new();
    let repos = store.repositories();

    let wait = EventWait {
        instance_id: InstanceId::new_random(),
        token: PositionToken::new_random(),
    };
    repos
        .correlations
        .register("payment.received", "order-9", wait.clone())
        .await?;

    assert_eq!(
        repos.correlations.find("payment.received", "order-9").await?,
        vec![wait.clone()]
    );
    assert!(repos
        .correlations
        .find("payment.received", "order-10")
        .await?
        .is_empty());

    repos
        .correlations
        .remove("payment.received", "order-9", &wait.token)
        .await?;
    assert!(repos
        .correlations
        .find("payment.received", "order-9")
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_runtime_runs_against_this_store() -> Result<(), EngineError> {
    use conveyor_core::{AutomaticAction, ProcessRuntime};
    use std::sync::Arc;

    struct Noop;
    #[async_trait::async_trait]
    impl AutomaticAction for Noop {
        async fn execute(
            &self,
            _config: &serde_json::Value,
            _variables: &VariableBag,
        ) -> Result<Payload, EngineError> {
            Ok(Payload::null())
        }
    }
    let store = InMemoryStateStore::new();
    let runtime = ProcessRuntime::builder(store.repositories())
        .action("noop", Arc::new(Noop))
        .build();

    let mut draft = definition("review", 0, false);
    draft.version = 0;
    let reference = runtime.publish_definition(draft).await?;
    let instance = runtime
        .instantiate(&reference.name, None, VariableBag::new())
        .await?;
    assert_eq!(instance.status, InstanceStatus::Completed);

    runtime.shutdown();
    Ok(())
}
