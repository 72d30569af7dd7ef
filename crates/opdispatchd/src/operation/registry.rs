//! Worker-side lookup from operation kind to executor.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use super::builtin::{Echo, Fail, Pause};
use super::{Operation, OperationEnvelope, OperationError, ResultRecord};

type Executor = Box<dyn Fn(&OperationEnvelope) -> Result<ResultRecord, OperationError> + Send + Sync>;

struct Registered {
    schema: u32,
    execute: Executor,
}

/// Maps operation kinds to type-erased executors.
#[derive(Default)]
pub struct OperationRegistry {
    executors: HashMap<&'static str, Registered>,
}

/// Errors raised while populating an [`OperationRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("operation kind '{0}' is already registered")]
    AlreadyRegistered(&'static str),
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the operations shipped with this crate.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert::<Echo>();
        registry.insert::<Pause>();
        registry.insert::<Fail>();
        registry
    }

    pub fn register<O: Operation>(&mut self) -> Result<&mut Self, RegistryError> {
        if self.executors.contains_key(O::KIND) {
            return Err(RegistryError::AlreadyRegistered(O::KIND));
        }
        self.insert::<O>();
        Ok(self)
    }

    fn insert<O: Operation>(&mut self) {
        let execute: Executor = Box::new(|envelope| {
            let mut operation = envelope.decode::<O>()?;
            let output = operation.perform_operation()?;
            ResultRecord::encode::<O>(&output)
        });
        self.executors.insert(
            O::KIND,
            Registered {
                schema: O::SCHEMA_VERSION,
                execute,
            },
        );
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.executors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Decodes and runs the operation. Panics are caught and reported.
    pub fn execute(&self, envelope: &OperationEnvelope) -> Result<ResultRecord, OperationError> {
        let registered =
            self.executors
                .get(envelope.kind.as_str())
                .ok_or_else(|| OperationError::UnknownKind {
                    kind: envelope.kind.clone(),
                })?;
        if registered.schema != envelope.schema {
            return Err(OperationError::SchemaMismatch {
                kind: envelope.kind.clone(),
                expected: registered.schema,
                received: envelope.schema,
            });
        }
        panic::catch_unwind(AssertUnwindSafe(|| (registered.execute)(envelope))).unwrap_or_else(
            |payload| {
                Err(OperationError::Panicked {
                    message: panic_message(payload.as_ref()),
                })
            },
        )
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::operation::OperationId;

    #[derive(Debug, Serialize, Deserialize)]
    struct Explode;

    impl Operation for Explode {
        const KIND: &'static str = "test.explode";
        type Output = ();

        fn perform_operation(&mut self) -> Result<(), OperationError> {
            panic!("boom");
        }
    }

    #[fixture]
    fn registry() -> OperationRegistry {
        OperationRegistry::with_builtins()
    }

    #[rstest]
    fn builtins_are_registered(registry: OperationRegistry) {
        assert_eq!(registry.kinds(), vec![Echo::KIND, Fail::KIND, Pause::KIND]);
    }

    #[rstest]
    fn duplicate_registration_is_rejected(mut registry: OperationRegistry) {
        let error = registry.register::<Echo>().expect_err("duplicate");
        assert!(matches!(error, RegistryError::AlreadyRegistered(kind) if kind == Echo::KIND));
    }

    #[rstest]
    fn executes_registered_operation(registry: OperationRegistry) {
        let envelope =
            OperationEnvelope::encode(OperationId::new(), &Echo::new("ping")).expect("encode");
        let record = registry.execute(&envelope).expect("execute");
        assert_eq!(record.decode::<Echo>().expect("decode"), "ping");
    }

    #[rstest]
    fn unknown_kind_is_reported(registry: OperationRegistry) {
        let envelope = OperationEnvelope::encode(OperationId::new(), &Explode).expect("encode");
        let error = registry.execute(&envelope).expect_err("unknown kind");
        assert_eq!(
            error,
            OperationError::UnknownKind {
                kind: "test.explode".to_string()
            }
        );
    }

    #[rstest]
    fn operation_failure_is_returned(registry: OperationRegistry) {
        let envelope =
            OperationEnvelope::encode(OperationId::new(), &Fail::new("nope")).expect("encode");
        let error = registry.execute(&envelope).expect_err("failure");
        assert_eq!(error, OperationError::failed("nope"));
    }

    #[rstest]
    fn panics_become_failures(mut registry: OperationRegistry) {
        registry.register::<Explode>().expect("register");
        let envelope = OperationEnvelope::encode(OperationId::new(), &Explode).expect("encode");
        let error = registry.execute(&envelope).expect_err("panic");
        assert_eq!(
            error,
            OperationError::Panicked {
                message: "boom".to_string()
            }
        );
    }
}
