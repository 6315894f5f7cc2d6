//! Conveyor: an embeddable, durable process orchestration engine.
//!
//! Hosts publish versioned process definitions (directed graphs of task,
//! timer, gateway, automatic, and event steps), instantiate them, and
//! drive instances with task completions and external events. All state
//! lives behind repository traits, so backends range from the in-memory
//! stores used in tests to a persistent store.
//!
//! ```no_run
//! use conveyor_core::domain::repository::memory;
//! use conveyor_core::{ProcessRuntime, VariableBag};
//!
//! # async fn demo() -> Result<(), conveyor_core::EngineError> {
//! let runtime = ProcessRuntime::builder(memory::repositories()).build();
//! let reference = runtime.publish_definition(my_definition()).await?;
//! let instance = runtime
//!     .instantiate(&reference.name, None, VariableBag::new())
//!     .await?;
//! println!("started {}", instance.id);
//! # Ok(())
//! # }
//! # fn my_definition() -> conveyor_core::ProcessDefinition { unimplemented!() }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod application;
pub mod domain;
pub mod error;
pub mod types;

pub use application::definition_service::DefinitionService;
pub use application::dispatcher::Dispatcher;
pub use application::event_bus::{EventBus, PublishOutcome};
pub use application::execution::{
    ActionRegistry, AutomaticAction, EngineEventHandler, ExecutionService, StepSignal,
};
pub use application::runtime::{InstanceSummary, ProcessRuntime, RuntimeBuilder};
pub use application::task_ledger::TaskLedger;
pub use application::EngineConfig;
pub use domain::definition::{
    DefinitionRef, Edge, EdgeTrigger, GatewayKind, ProcessDefinition, StepKind, StepSpec,
    TriggerSpec,
};
pub use domain::events::DomainEvent;
pub use domain::guard::{GuardEvaluator, JmespathGuard};
pub use domain::instance::{
    ActivePosition, DefinitionName, InstanceId, InstanceStatus, PositionToken, ProcessInstance,
    TaskId, TimerId, WaitKind,
};
pub use domain::repository::{
    CorrelationRepository, DefinitionRepository, EventWait, InstanceRepository, Repositories,
    TaskRepository, TimerRepository,
};
pub use domain::task::{Task, TaskStatus};
pub use domain::timer::{TimerPurpose, TimerStatus, TimerSubscription};
pub use error::EngineError;
pub use types::{Payload, VariableBag};
