//! Publishing and lookup of process definitions.

use crate::domain::definition::{DefinitionRef, ProcessDefinition};
use crate::domain::guard::GuardEvaluator;
use crate::domain::instance::DefinitionName;
use crate::domain::repository::DefinitionRepository;
use crate::EngineError;
use std::sync::Arc;
use tracing::info;

/// Service owning the definition store.
///
/// Publishing never overwrites: each publish validates the draft and
/// stores it as the next version of its name. Old versions stay readable
/// for the instances pinned to them. Guard expressions are checked with
/// the same evaluator the engine routes with, so a host that swaps in a
/// custom evaluator gets its syntax accepted at publish.
pub struct DefinitionService {
    definitions: Arc<dyn DefinitionRepository>,
    guard: Arc<dyn GuardEvaluator>,
}

impl DefinitionService {
    /// Create a service over the given store and guard evaluator
    pub fn new(definitions: Arc<dyn DefinitionRepository>, guard: Arc<dyn GuardEvaluator>) -> Self {
        Self { definitions, guard }
    }

    /// Validate a draft and store it as the next active version of its
    /// name. The draft's own version field is ignored.
    pub async fn publish(
        &self,
        mut definition: ProcessDefinition,
    ) -> Result<DefinitionRef, EngineError> {
        definition.validate()?;
        for step in &definition.steps {
            for edge in &step.edges {
                if let Some(guard) = &edge.guard {
                    self.guard.validate(guard)?;
                }
            }
        }

        let existing = self.definitions.list_versions(&definition.name).await?;
        definition.version = existing.last().map(|d| d.version + 1).unwrap_or(1);
        definition.active = true;
        self.definitions.save(&definition).await?;

        info!(
            definition = %definition.name,
            version = definition.version,
            steps = definition.steps.len(),
            "published definition"
        );
        Ok(DefinitionRef {
            name: definition.name,
            version: definition.version,
        })
    }

    /// Fetch a specific version
    pub async fn get(
        &self,
        reference: &DefinitionRef,
    ) -> Result<ProcessDefinition, EngineError> {
        self.definitions
            .find(reference)
            .await?
            .ok_or_else(|| {
                EngineError::DefinitionNotFound(format!(
                    "{} v{}",
                    reference.name, reference.version
                ))
            })
    }

    /// Fetch the highest active version of a name
    pub async fn get_active(
        &self,
        name: &DefinitionName,
    ) -> Result<ProcessDefinition, EngineError> {
        self.definitions
            .find_active(name)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(name.to_string()))
    }

    /// Withdraw a version from `get_active` resolution. Instances already
    /// pinned to it keep running.
    pub async fn deactivate(&self, reference: &DefinitionRef) -> Result<(), EngineError> {
        let mut definition = self.get(reference).await?;
        if definition.active {
            definition.active = false;
            self.definitions.save(&definition).await?;
            info!(definition = %reference.name, version = reference.version, "deactivated definition");
        }
        Ok(())
    }

    /// List all versions of a name, oldest first
    pub async fn list_versions(
        &self,
        name: &DefinitionName,
    ) -> Result<Vec<ProcessDefinition>, EngineError> {
        self.definitions.list_versions(name).await
    }

    /// List every known definition name
    pub async fn list_names(&self) -> Result<Vec<DefinitionName>, EngineError> {
        self.definitions.list_names().await
    }
}
