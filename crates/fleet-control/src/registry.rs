//! Handler registry - operation type to handler factory, built once at startup

use crate::error::{ControlError, Result};
use crate::handler::Handler;
use fleet_types::OperationType;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Produces a fresh handler for each run
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Immutable map of operation types to handler factories
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<OperationType, HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Instantiate the handler for `operation_type`.
    ///
    /// The instance must report the operation type it was registered under.
    pub fn create(&self, operation_type: &OperationType) -> Result<Box<dyn Handler>> {
        let factory = self
            .handlers
            .get(operation_type)
            .ok_or_else(|| ControlError::UnsupportedOperation(operation_type.clone()))?;

        let handler = factory();
        let reported = handler.operation_type();
        if &reported != operation_type {
            return Err(ControlError::HandlerMismatch {
                registered: operation_type.clone(),
                reported,
            });
        }
        Ok(handler)
    }

    pub fn contains(&self, operation_type: &OperationType) -> bool {
        self.handlers.contains_key(operation_type)
    }

    /// Registered operation types, sorted
    pub fn operation_types(&self) -> Vec<OperationType> {
        let mut types: Vec<OperationType> = self.handlers.keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operation_types", &self.operation_types())
            .finish()
    }
}

/// Builder for [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<OperationType, HandlerFactory>,
}

impl HandlerRegistryBuilder {
    /// Register a factory for `operation_type`.
    ///
    /// Fails with `DuplicateHandler` if the type already has one.
    pub fn register<F, H>(mut self, operation_type: OperationType, factory: F) -> Result<Self>
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        if self.handlers.contains_key(&operation_type) {
            return Err(ControlError::DuplicateHandler(operation_type));
        }

        let factory: HandlerFactory = Arc::new(move || Box::new(factory()) as Box<dyn Handler>);
        self.handlers.insert(operation_type, factory);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowContext;
    use async_trait::async_trait;
    use fleet_types::WorkflowOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop {
        reports: OperationType,
    }

    #[async_trait]
    impl Handler for Noop {
        fn operation_type(&self) -> OperationType {
            self.reports.clone()
        }

        async fn execute(&self, _ctx: &WorkflowContext) -> Result<WorkflowOutcome> {
            Ok(WorkflowOutcome::Success)
        }
    }

    #[test]
    fn test_lookup_is_exact() {
        let registry = HandlerRegistry::builder()
            .register(OperationType::DIAGNOSTICS, || Noop {
                reports: OperationType::DIAGNOSTICS,
            })
            .unwrap()
            .build();

        let handler = registry.create(&OperationType::DIAGNOSTICS).unwrap();
        assert!(handler.supports_cancellation());

        let err = registry
            .create(&OperationType::new("diagnostics"))
            .err()
            .unwrap();
        assert!(matches!(err, ControlError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_factory_not_called_at_registration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = HandlerRegistry::builder()
            .register(OperationType::ENV_BACKUP, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Noop {
                    reports: OperationType::ENV_BACKUP,
                }
            })
            .unwrap()
            .build();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.create(&OperationType::ENV_BACKUP).unwrap();
        registry.create(&OperationType::ENV_BACKUP).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mismatched_handler_is_rejected() {
        let registry = HandlerRegistry::builder()
            .register(OperationType::ENV_RESTORE, || Noop {
                reports: OperationType::ENV_BACKUP,
            })
            .unwrap()
            .build();

        let err = registry.create(&OperationType::ENV_RESTORE).err().unwrap();
        assert!(matches!(
            err,
            ControlError::HandlerMismatch { registered, reported }
                if registered == OperationType::ENV_RESTORE && reported == OperationType::ENV_BACKUP
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let noop = || Noop {
            reports: OperationType::ENV_BACKUP,
        };
        let err = HandlerRegistry::builder()
            .register(OperationType::ENV_BACKUP, noop)
            .unwrap()
            .register(OperationType::ENV_BACKUP, noop)
            .err()
            .unwrap();
        assert!(matches!(err, ControlError::DuplicateHandler(op) if op == OperationType::ENV_BACKUP));
    }
}
