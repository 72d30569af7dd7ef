//! Messages exchanged between the dispatch server and its workers.

use serde::{Deserialize, Serialize};

use crate::operation::{OperationEnvelope, OperationError, ResultRecord};

/// Bumped whenever a message changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Every frame on a dispatch connection carries exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum WireMessage {
    /// Worker → server, first message on a connection.
    Authenticate {
        protocol_version: u32,
        worker_number: usize,
        token: String,
    },
    /// Server → worker.
    AuthenticateAccepted { accepted: bool },
    /// Server → worker.
    DoOperation { operation: OperationEnvelope },
    /// Worker → server, sent before execution starts.
    AcknowledgeOperation { ok: bool },
    /// Worker → server. Exactly one of `result` and `error` is set.
    DoneOperation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ResultRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<OperationError>,
        will_exit: bool,
    },
}

impl WireMessage {
    /// Short name used in logs and protocol violation reports.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::AuthenticateAccepted { .. } => "authenticate_accepted",
            Self::DoOperation { .. } => "do_operation",
            Self::AcknowledgeOperation { .. } => "acknowledge_operation",
            Self::DoneOperation { .. } => "done_operation",
        }
    }

    /// Builds a completion message from an execution outcome.
    #[must_use]
    pub fn done(outcome: Result<ResultRecord, OperationError>, will_exit: bool) -> Self {
        match outcome {
            Ok(record) => Self::DoneOperation {
                result: Some(record),
                error: None,
                will_exit,
            },
            Err(error) => Self::DoneOperation {
                result: None,
                error: Some(error),
                will_exit,
            },
        }
    }
}

/// Folds the two optional completion fields back into one outcome.
pub(crate) fn completion_outcome(
    result: Option<ResultRecord>,
    error: Option<OperationError>,
) -> Result<ResultRecord, OperationError> {
    match (result, error) {
        (_, Some(error)) => Err(error),
        (Some(record), None) => Ok(record),
        (None, None) => Err(OperationError::Failed {
            message: "worker reported completion without a result".to_string(),
        }),
    }
}
