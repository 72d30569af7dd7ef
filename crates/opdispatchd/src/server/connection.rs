//! Per-connection protocol loop.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::auth::tokens_match;
use super::{ConnectionError, ProtocolTimings, SERVER_TARGET};
use crate::dispatcher::{Assignment, Dispatcher, WorkerHandle, WorkerState};
use crate::health::HealthReporter;
use crate::operation::{OperationError, OperationId, duration_millis};
use crate::protocol::{PROTOCOL_VERSION, WireMessage, completion_outcome};
use crate::transport::{ConnectionHandler, FramePipe, PipeError};

/// Serves worker connections accepted by the
/// [`SocketListener`](crate::transport::SocketListener).
pub struct DispatchConnectionHandler {
    dispatcher: Arc<Dispatcher>,
    token: String,
    timings: ProtocolTimings,
    reporter: Arc<dyn HealthReporter>,
}

/// Whether the connection loop carries on after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

impl DispatchConnectionHandler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        token: impl Into<String>,
        timings: ProtocolTimings,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            dispatcher,
            token: token.into(),
            timings,
            reporter,
        }
    }

    fn serve(&self, pipe: &mut FramePipe, session: &mut Option<WorkerHandle>) -> Result<(), ConnectionError> {
        let worker = self.authenticate(pipe)?;
        let handle = match self.dispatcher.worker_connected(worker, pipe.waker()) {
            Ok(handle) => handle,
            Err(error) => {
                reject(pipe);
                return Err(error.into());
            }
        };
        *session = Some(handle);
        pipe.send(&WireMessage::AuthenticateAccepted { accepted: true })?;
        self.reporter.worker_connected(worker, handle.generation());

        loop {
            match self.dispatcher.next_work(handle)? {
                None => self.idle(pipe, worker)?,
                Some(assignment) => {
                    if self.dispatch(pipe, handle, assignment)? == Flow::Exit {
                        info!(target: SERVER_TARGET, worker, "worker is exiting");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn authenticate(&self, pipe: &mut FramePipe) -> Result<usize, ConnectionError> {
        let message = receive_within(pipe, self.timings.authenticate)?.ok_or(
            ConnectionError::AuthenticationTimeout {
                waited_ms: duration_millis(self.timings.authenticate),
            },
        )?;
        let WireMessage::Authenticate {
            protocol_version,
            worker_number,
            token,
        } = message
        else {
            return Err(ConnectionError::UnexpectedMessage {
                expected: "authenticate",
                received: message.name(),
            });
        };
        if protocol_version != PROTOCOL_VERSION {
            reject(pipe);
            return Err(ConnectionError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                received: protocol_version,
            });
        }
        if !tokens_match(&self.token, &token) {
            reject(pipe);
            return Err(ConnectionError::InvalidToken {
                worker: worker_number,
            });
        }
        Ok(worker_number)
    }

    /// Waits for the worker while there is no work for it. Returns early when
    /// the dispatcher wakes the connection. The worker must stay silent.
    fn idle(&self, pipe: &mut FramePipe, worker: usize) -> Result<(), ConnectionError> {
        match pipe.receive::<WireMessage>(self.timings.idle_poll(worker))? {
            None => Ok(()),
            Some(message) => Err(ConnectionError::UnexpectedMessage {
                expected: "no message while idle",
                received: message.name(),
            }),
        }
    }

    fn dispatch(
        &self,
        pipe: &mut FramePipe,
        handle: WorkerHandle,
        assignment: Assignment,
    ) -> Result<Flow, ConnectionError> {
        let worker = handle.number();
        let operation = assignment.id();
        debug!(
            target: SERVER_TARGET,
            worker,
            operation = %operation,
            kind = assignment.kind(),
            "sending operation"
        );
        let handed_off = pipe
            .send(&WireMessage::DoOperation {
                operation: assignment.envelope().clone(),
            })
            .map_err(ConnectionError::from)
            .and_then(|()| self.await_acknowledgement(pipe, worker, operation));
        if let Err(error) = handed_off {
            self.dispatcher
                .return_work(handle, assignment, WorkerState::Failed)?;
            return Err(error);
        }

        let kind = assignment.kind();
        match receive_within(pipe, self.timings.execution) {
            Ok(Some(WireMessage::DoneOperation {
                result,
                error,
                will_exit,
            })) => {
                let state = if will_exit {
                    WorkerState::Disconnecting
                } else {
                    WorkerState::Ok
                };
                self.dispatcher.finished_work(
                    handle,
                    assignment,
                    completion_outcome(result, error),
                    state,
                )?;
                Ok(if will_exit { Flow::Exit } else { Flow::Continue })
            }
            Ok(Some(message)) => {
                let failure = OperationError::dispatch(format!(
                    "worker {worker} sent {} instead of a result",
                    message.name()
                ));
                self.dispatcher
                    .finished_work(handle, assignment, Err(failure), WorkerState::Failed)?;
                Err(ConnectionError::UnexpectedMessage {
                    expected: "done_operation",
                    received: message.name(),
                })
            }
            Ok(None) => {
                let waited_ms = duration_millis(self.timings.execution);
                let failure = OperationError::Timeout {
                    kind: kind.to_string(),
                    waited_ms,
                };
                self.dispatcher
                    .finished_work(handle, assignment, Err(failure), WorkerState::Failed)?;
                Err(ConnectionError::ExecutionTimeout {
                    worker,
                    operation,
                    waited_ms,
                })
            }
            // A result cut off mid-frame counts as a broken connection, not an
            // execution timeout; only a silent worker earns `Timeout`.
            Err(error) => {
                let failure =
                    OperationError::dispatch(format!("worker {worker} connection failed: {error}"));
                self.dispatcher
                    .finished_work(handle, assignment, Err(failure), WorkerState::Failed)?;
                Err(error.into())
            }
        }
    }

    fn await_acknowledgement(
        &self,
        pipe: &mut FramePipe,
        worker: usize,
        operation: OperationId,
    ) -> Result<(), ConnectionError> {
        match receive_within(pipe, self.timings.acknowledge)? {
            Some(WireMessage::AcknowledgeOperation { ok: true }) => Ok(()),
            Some(WireMessage::AcknowledgeOperation { ok: false }) => {
                Err(ConnectionError::AcknowledgeRefused { worker, operation })
            }
            Some(message) => Err(ConnectionError::UnexpectedMessage {
                expected: "acknowledge_operation",
                received: message.name(),
            }),
            None => Err(ConnectionError::AcknowledgeTimeout {
                worker,
                operation,
                waited_ms: duration_millis(self.timings.acknowledge),
            }),
        }
    }
}

impl ConnectionHandler for DispatchConnectionHandler {
    fn handle(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let mut session = None;
        let result = FramePipe::new(stream)
            .map_err(ConnectionError::from)
            .and_then(|mut pipe| {
                let result = self.serve(&mut pipe, &mut session);
                pipe.close();
                result
            });
        if let Some(handle) = session {
            self.dispatcher.cleanup_connection(handle);
        } else if let Err(error) = &result {
            warn!(
                target: SERVER_TARGET,
                peer = ?peer,
                error = %error,
                "worker connection rejected"
            );
            return;
        }
        self.reporter
            .worker_disconnected(session.map(|handle| handle.number()), result.as_ref().err());
    }
}

impl std::fmt::Debug for DispatchConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchConnectionHandler")
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

/// Best-effort refusal sent before closing a connection.
fn reject(pipe: &mut FramePipe) {
    if let Err(error) = pipe.send(&WireMessage::AuthenticateAccepted { accepted: false }) {
        debug!(target: SERVER_TARGET, error = %error, "failed to send authentication refusal");
    }
}

/// Receives with a fixed deadline. Wake requests only matter while a worker
/// is idle, so any that arrive here are skipped.
fn receive_within(pipe: &mut FramePipe, timeout: Duration) -> Result<Option<WireMessage>, PipeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        if let Some(message) = pipe.receive(remaining)? {
            return Ok(Some(message));
        }
    }
}
