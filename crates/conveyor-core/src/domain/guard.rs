use crate::types::VariableBag;
use crate::EngineError;
use serde_json::json;

/// Evaluates edge guard expressions against instance variables.
///
/// A seam so routing logic can be exercised with a canned evaluator in
/// tests while production uses JMESPath.
pub trait GuardEvaluator: Send + Sync {
    /// Evaluate a guard expression to a boolean. Variables are exposed to
    /// the expression under the `vars` key.
    fn evaluate(&self, expression: &str, variables: &VariableBag) -> Result<bool, EngineError>;

    /// Check an expression at publish time, before any instance exists.
    /// The default accepts everything; evaluators with a compile step
    /// override this so bad guards are rejected up front.
    fn validate(&self, expression: &str) -> Result<(), EngineError> {
        let _ = expression;
        Ok(())
    }
}

/// JMESPath-backed guard evaluator
#[derive(Debug, Default)]
pub struct JmespathGuard;

impl GuardEvaluator for JmespathGuard {
    fn evaluate(&self, expression: &str, variables: &VariableBag) -> Result<bool, EngineError> {
        let compiled = jmespath::compile(expression).map_err(|e| {
            EngineError::StepConfigError(format!("invalid guard '{}': {}", expression, e))
        })?;

        let context = json!({ "vars": variables.as_object() });
        let result = compiled.search(&context).map_err(|e| {
            EngineError::StepConfigError(format!(
                "guard '{}' failed to evaluate: {}",
                expression, e
            ))
        })?;

        Ok(result.is_truthy())
    }

    fn validate(&self, expression: &str) -> Result<(), EngineError> {
        jmespath::compile(expression)
            .map(|_| ())
            .map_err(|e| {
                EngineError::DefinitionInvalid(format!("invalid guard '{}': {}", expression, e))
            })
    }
}
