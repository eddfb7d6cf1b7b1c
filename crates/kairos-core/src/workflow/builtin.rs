//! Built-in operators: `echo`, `noop` and `fail`.

use super::operator::{Operator, OperatorContext, OperatorFactory, TaskExecutionError, TaskResult};
use super::registry::OperatorRegistry;

/// Register every built-in operator.
pub fn register_builtins(registry: &mut OperatorRegistry) {
    registry.register(EchoOperatorFactory);
    registry.register(NoopOperatorFactory);
    registry.register(FailOperatorFactory);
}

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

/// Logs `config.message` and stores it as `message`.
pub struct EchoOperatorFactory;

pub struct EchoOperator {
    context: OperatorContext,
}

impl OperatorFactory for EchoOperatorFactory {
    type Operator = EchoOperator;

    fn operator_type(&self) -> &str {
        "echo"
    }

    fn new_operator(&self, context: OperatorContext) -> EchoOperator {
        EchoOperator { context }
    }
}

impl Operator for EchoOperator {
    async fn run_task(&mut self) -> Result<TaskResult, TaskExecutionError> {
        let request = &self.context.request;
        let message = request.config_str("message").unwrap_or_default().to_string();
        tracing::info!(task = %request.full_name(), "{message}");
        Ok(TaskResult::empty().with_store_param("message", message))
    }
}

// ---------------------------------------------------------------------------
// noop
// ---------------------------------------------------------------------------

pub struct NoopOperatorFactory;

pub struct NoopOperator;

impl OperatorFactory for NoopOperatorFactory {
    type Operator = NoopOperator;

    fn operator_type(&self) -> &str {
        "noop"
    }

    fn new_operator(&self, _context: OperatorContext) -> NoopOperator {
        NoopOperator
    }
}

impl Operator for NoopOperator {
    async fn run_task(&mut self) -> Result<TaskResult, TaskExecutionError> {
        Ok(TaskResult::empty())
    }
}

// ---------------------------------------------------------------------------
// fail
// ---------------------------------------------------------------------------

/// Always fails deterministically with `config.message`.
pub struct FailOperatorFactory;

pub struct FailOperator {
    context: OperatorContext,
}

impl OperatorFactory for FailOperatorFactory {
    type Operator = FailOperator;

    fn operator_type(&self) -> &str {
        "fail"
    }

    fn new_operator(&self, context: OperatorContext) -> FailOperator {
        FailOperator { context }
    }
}

impl Operator for FailOperator {
    async fn run_task(&mut self) -> Result<TaskResult, TaskExecutionError> {
        let message = self
            .context
            .request
            .config_str("message")
            .unwrap_or("task failed")
            .to_string();
        Err(TaskExecutionError::with_error_config(
            message.clone(),
            serde_json::json!({ "message": message, "task": self.context.request.full_name() }),
        ))
    }
}
