//! Admission and fairness limits fixed for one dispatcher run.

use opdispatch_config::{
    Config, DEFAULT_MAX_OPS_PER_APPLICATION, DEFAULT_MAX_QUEUE_LENGTH, DEFAULT_WORKERS,
};
use thiserror::Error;

/// Worker pool size, per-application ceiling and queue bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    workers: usize,
    max_ops_per_application: usize,
    max_queue_length: usize,
}

/// Raised when a policy limit is zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("policy limit {field} must be greater than zero")]
    Zero { field: &'static str },
}

impl Policy {
    pub fn new(
        workers: usize,
        max_ops_per_application: usize,
        max_queue_length: usize,
    ) -> Result<Self, PolicyError> {
        for (field, value) in [
            ("workers", workers),
            ("max_ops_per_application", max_ops_per_application),
            ("max_queue_length", max_queue_length),
        ] {
            if value == 0 {
                return Err(PolicyError::Zero { field });
            }
        }
        Ok(Self {
            workers,
            max_ops_per_application,
            max_queue_length,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, PolicyError> {
        Self::new(
            config.workers,
            config.max_ops_per_application,
            config.max_queue_length,
        )
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub const fn max_ops_per_application(&self) -> usize {
        self.max_ops_per_application
    }

    #[must_use]
    pub const fn max_queue_length(&self) -> usize {
        self.max_queue_length
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_ops_per_application: DEFAULT_MAX_OPS_PER_APPLICATION,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}
