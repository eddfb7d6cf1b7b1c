//! Dynamic operator dispatch and the type-tag registry.
//!
//! Same blanket-impl pattern used for every RPITIT trait that must be picked
//! at runtime:
//! 1. Define object-safe `OperatorDyn` / `OperatorFactoryDyn` traits with boxed futures
//! 2. Blanket-impl them for all `T: Operator` / `F: OperatorFactory`
//! 3. `BoxOperator` wraps `Box<dyn OperatorDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::operator::{Operator, OperatorContext, OperatorFactory, TaskExecutionError, TaskResult};

// ---------------------------------------------------------------------------
// Boxed operator
// ---------------------------------------------------------------------------

/// Object-safe version of [`Operator`] with a boxed future.
pub trait OperatorDyn: Send {
    fn run_task_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<TaskResult, TaskExecutionError>> + Send + '_>>;
}

impl<T: Operator> OperatorDyn for T {
    fn run_task_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<TaskResult, TaskExecutionError>> + Send + '_>> {
        Box::pin(self.run_task())
    }
}

/// Type-erased operator produced by the registry.
pub struct BoxOperator {
    inner: Box<dyn OperatorDyn>,
}

impl BoxOperator {
    pub fn new<T: Operator + 'static>(operator: T) -> Self {
        Self {
            inner: Box::new(operator),
        }
    }

    pub async fn run_task(&mut self) -> Result<TaskResult, TaskExecutionError> {
        self.inner.run_task_boxed().await
    }
}

// ---------------------------------------------------------------------------
// Boxed factory
// ---------------------------------------------------------------------------

/// Object-safe version of [`OperatorFactory`].
pub trait OperatorFactoryDyn: Send + Sync {
    fn operator_type(&self) -> &str;

    fn new_operator_boxed(&self, context: OperatorContext) -> BoxOperator;
}

impl<F: OperatorFactory> OperatorFactoryDyn for F {
    fn operator_type(&self) -> &str {
        OperatorFactory::operator_type(self)
    }

    fn new_operator_boxed(&self, context: OperatorContext) -> BoxOperator {
        BoxOperator::new(self.new_operator(context))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Operator factories indexed by task type tag.
#[derive(Clone)]
pub struct OperatorRegistry {
    factories: HashMap<String, Arc<dyn OperatorFactoryDyn>>,
}

impl OperatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in `echo`, `noop` and `fail` operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a factory under its own type tag, replacing any previous one.
    pub fn register<F: OperatorFactory + 'static>(&mut self, factory: F) {
        let key = OperatorFactory::operator_type(&factory).to_string();
        self.factories.insert(key, Arc::new(factory));
    }

    pub fn get(&self, operator_type: &str) -> Option<&Arc<dyn OperatorFactoryDyn>> {
        self.factories.get(operator_type)
    }

    /// Build an operator for `context.request.task_type`.
    pub fn new_operator(&self, context: OperatorContext) -> Option<BoxOperator> {
        self.factories
            .get(context.request.task_type.as_str())
            .map(|f| f.new_operator_boxed(context))
    }

    /// List all registered type tags, sorted.
    pub fn list_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("types", &self.list_types())
            .finish()
    }
}
