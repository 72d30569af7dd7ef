//! Length-prefixed JSON frames over one TCP connection.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! The socket is non-blocking; every wait goes through `poll(2)` so that a
//! [`PipeWaker`] can interrupt a receive from another thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::poll::{self, Interest};
use super::wake::{self, PipeWaker};
use super::{PipeError, TRANSPORT_TARGET};

/// Upper bound for a whole frame, length prefix included.
pub const FRAME_CAPACITY: usize = 4 * 1024 * 1024;

/// Extra time granted once when a frame is partially buffered at the deadline.
pub const RECEIVE_GRACE: Duration = Duration::from_millis(1000);

const LENGTH_PREFIX: usize = 4;
const READ_CHUNK: usize = 64 * 1024;
const WRITE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(60);

/// Bidirectional message channel over a connected TCP stream.
#[derive(Debug)]
pub struct FramePipe {
    stream: TcpStream,
    waker: Arc<PipeWaker>,
    wake_listener: UnixStream,
    inbound: Vec<u8>,
    scratch: Box<[u8]>,
    capacity: usize,
    peer_closed: bool,
    closed: bool,
}

impl FramePipe {
    /// Wraps a connected stream using the default frame capacity.
    pub fn new(stream: TcpStream) -> Result<Self, PipeError> {
        Self::with_capacity(stream, FRAME_CAPACITY)
    }

    /// Wraps a connected stream with a custom frame capacity.
    pub fn with_capacity(stream: TcpStream, capacity: usize) -> Result<Self, PipeError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let (waker, wake_listener) = PipeWaker::pair()?;
        Ok(Self {
            stream,
            waker,
            wake_listener,
            inbound: Vec::with_capacity(READ_CHUNK),
            scratch: vec![0_u8; READ_CHUNK].into_boxed_slice(),
            capacity,
            peer_closed: false,
            closed: false,
        })
    }

    /// Connects to `addr` and wraps the resulting stream.
    pub fn connect(addr: SocketAddr) -> Result<Self, PipeError> {
        let stream = TcpStream::connect(addr)?;
        Self::new(stream)
    }

    /// Shared waker that interrupts [`Self::receive`] from any thread.
    #[must_use]
    pub fn waker(&self) -> Arc<PipeWaker> {
        Arc::clone(&self.waker)
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shuts the socket down in both directions.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(error) = self.stream.shutdown(Shutdown::Both)
            && error.kind() != io::ErrorKind::NotConnected
        {
            debug!(target: TRANSPORT_TARGET, error = %error, "socket shutdown failed");
        }
    }

    /// Serializes `message` and writes it as one frame.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), PipeError> {
        if self.closed {
            return Err(PipeError::Closed);
        }
        let payload = serde_json::to_vec(message).map_err(PipeError::Encode)?;
        let size = payload.len() + LENGTH_PREFIX;
        let too_large = PipeError::FrameTooLarge {
            size,
            limit: self.capacity,
        };
        if size > self.capacity {
            return Err(too_large);
        }
        let length = u32::try_from(payload.len()).map_err(|_| too_large)?;
        let mut frame = Vec::with_capacity(size);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&payload);
        self.write_frame(&frame)
    }

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing buffered or
    /// when a wake request is pending. A partially received frame earns a
    /// single [`RECEIVE_GRACE`] extension before the wait fails.
    pub fn receive<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<Option<T>, PipeError> {
        if self.closed {
            return Err(PipeError::Closed);
        }
        let mut deadline = Instant::now() + timeout;
        let mut extended = false;
        loop {
            if let Some(payload) = self.take_frame()? {
                return serde_json::from_slice(&payload)
                    .map(Some)
                    .map_err(PipeError::Decode);
            }
            if self.fill()? > 0 {
                continue;
            }
            if self.waker.take() {
                trace!(target: TRANSPORT_TARGET, "receive interrupted by wake request");
                return Ok(None);
            }
            if Instant::now() >= deadline {
                if self.inbound.is_empty() {
                    return Ok(None);
                }
                if extended {
                    return Err(PipeError::TimedOutMidFrame {
                        buffered: self.inbound.len(),
                    });
                }
                debug!(
                    target: TRANSPORT_TARGET,
                    buffered = self.inbound.len(),
                    "extending receive deadline for a partial frame"
                );
                deadline += RECEIVE_GRACE;
                extended = true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let readiness = poll::wait(
                self.stream.as_raw_fd(),
                Interest::Readable,
                Some(self.wake_listener.as_raw_fd()),
                remaining,
            )?;
            if readiness.wake {
                wake::drain(&self.wake_listener);
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, PipeError> {
        let Some(prefix) = self.inbound.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let Ok(bytes) = <[u8; LENGTH_PREFIX]>::try_from(prefix) else {
            return Ok(None);
        };
        let size = u32::from_be_bytes(bytes) as usize + LENGTH_PREFIX;
        if size > self.capacity {
            return Err(PipeError::FrameTooLarge {
                size,
                limit: self.capacity,
            });
        }
        if self.inbound.len() < size {
            return Ok(None);
        }
        let payload = self.inbound[LENGTH_PREFIX..size].to_vec();
        self.inbound.drain(..size);
        Ok(Some(payload))
    }

    /// Reads whatever the socket has ready without blocking.
    fn fill(&mut self) -> Result<usize, PipeError> {
        if self.peer_closed {
            return Err(PipeError::Closed);
        }
        let mut total = 0;
        loop {
            match self.stream.read(&mut self.scratch) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(read) => {
                    self.inbound.extend_from_slice(&self.scratch[..read]);
                    total += read;
                    if self.inbound.len() >= self.capacity {
                        break;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(PipeError::from_socket(error)),
            }
        }
        if total == 0 && self.peer_closed {
            return Err(PipeError::Closed);
        }
        Ok(total)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), PipeError> {
        let mut written = 0;
        let mut last_progress = Instant::now();
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => return Err(PipeError::Closed),
                Ok(count) => {
                    written += count;
                    last_progress = Instant::now();
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if last_progress.elapsed() >= WRITE_STALL_LIMIT {
                        return Err(PipeError::WriteStalled {
                            written,
                            total: frame.len(),
                        });
                    }
                    poll::wait(
                        self.stream.as_raw_fd(),
                        Interest::Writable,
                        None,
                        WRITE_POLL_INTERVAL,
                    )?;
                }
                Err(error) => return Err(PipeError::from_socket(error)),
            }
        }
        Ok(())
    }
}
