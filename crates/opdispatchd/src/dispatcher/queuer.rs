//! Per-application submission handle.

use std::sync::Arc;

use super::{ApplicationId, Dispatcher};
use crate::operation::{OpQueuer, OperationError, QueuedOperation};

/// Submits operations to a [`Dispatcher`] on behalf of one application.
#[derive(Debug, Clone)]
pub struct ApplicationQueuer {
    dispatcher: Arc<Dispatcher>,
    application: ApplicationId,
}

impl ApplicationQueuer {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, application: ApplicationId) -> Self {
        Self {
            dispatcher,
            application,
        }
    }

    #[must_use]
    pub fn application(&self) -> &ApplicationId {
        &self.application
    }
}

impl OpQueuer for ApplicationQueuer {
    fn queue_operation(&self, operation: Box<dyn QueuedOperation>) -> Result<(), OperationError> {
        self.dispatcher
            .queue_operation(operation, self.application.clone())
            .map_err(OperationError::from)
    }
}
