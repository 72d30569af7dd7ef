//! Operations shipped with the worker binary.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Operation, OperationError};

/// Returns its message unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Echo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Operation for Echo {
    const KIND: &'static str = "opdispatch.echo";
    type Output = String;

    fn perform_operation(&mut self) -> Result<String, OperationError> {
        Ok(self.message.clone())
    }
}

/// Sleeps on the worker, then reports how long it slept in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pause {
    pub millis: u64,
}

impl Pause {
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self {
            millis: duration.as_millis() as u64,
        }
    }
}

impl Operation for Pause {
    const KIND: &'static str = "opdispatch.pause";
    type Output = u64;

    fn perform_operation(&mut self) -> Result<u64, OperationError> {
        thread::sleep(Duration::from_millis(self.millis));
        Ok(self.millis)
    }
}

/// Always fails with its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fail {
    pub message: String,
}

impl Fail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Operation for Fail {
    const KIND: &'static str = "opdispatch.fail";
    type Output = ();

    fn perform_operation(&mut self) -> Result<(), OperationError> {
        Err(OperationError::failed(self.message.clone()))
    }
}
