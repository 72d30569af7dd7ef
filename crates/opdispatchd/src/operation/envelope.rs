//! Wire representations of operations and their results.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Operation, OperationError};

/// Identifier attached to every submission for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An operation as sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub id: OperationId,
    pub kind: String,
    pub schema: u32,
    pub payload: Value,
}

impl OperationEnvelope {
    pub fn encode<O: Operation>(id: OperationId, operation: &O) -> Result<Self, OperationError> {
        let payload =
            serde_json::to_value(operation).map_err(|error| OperationError::Serialization {
                message: error.to_string(),
            })?;
        Ok(Self {
            id,
            kind: O::KIND.to_string(),
            schema: O::SCHEMA_VERSION,
            payload,
        })
    }

    /// Rebuilds the operation, checking kind and schema first.
    pub fn decode<O: Operation>(&self) -> Result<O, OperationError> {
        if self.kind != O::KIND {
            return Err(OperationError::UnknownKind {
                kind: self.kind.clone(),
            });
        }
        if self.schema != O::SCHEMA_VERSION {
            return Err(OperationError::SchemaMismatch {
                kind: self.kind.clone(),
                expected: O::SCHEMA_VERSION,
                received: self.schema,
            });
        }
        O::deserialize(&self.payload).map_err(|error| OperationError::Serialization {
            message: error.to_string(),
        })
    }
}

/// The output of a completed operation as sent back by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub kind: String,
    pub schema: u32,
    pub output: Value,
}

impl ResultRecord {
    pub fn encode<O: Operation>(output: &O::Output) -> Result<Self, OperationError> {
        let output = serde_json::to_value(output).map_err(|error| OperationError::Serialization {
            message: error.to_string(),
        })?;
        Ok(Self {
            kind: O::KIND.to_string(),
            schema: O::SCHEMA_VERSION,
            output,
        })
    }

    /// Converts the record into the submitting operation's output type.
    ///
    /// Any mismatch is reported as [`OperationError::ResultMerge`].
    pub fn decode<O: Operation>(self) -> Result<O::Output, OperationError> {
        if self.kind != O::KIND || self.schema != O::SCHEMA_VERSION {
            return Err(OperationError::ResultMerge {
                message: format!(
                    "result for {} v{} cannot be applied to {} v{}",
                    self.kind,
                    self.schema,
                    O::KIND,
                    O::SCHEMA_VERSION
                ),
            });
        }
        serde_json::from_value(self.output).map_err(|error| OperationError::ResultMerge {
            message: error.to_string(),
        })
    }
}
