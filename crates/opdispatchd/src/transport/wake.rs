//! Wake signalling used to cut a blocking receive short.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::TRANSPORT_TARGET;

/// Interrupts a connection thread that is parked waiting for its worker.
pub trait WorkerWaker: Send + Sync {
    /// Requests that the current or next blocking wait returns early.
    fn wake(&self);

    /// Withdraws a pending wake request.
    fn clear(&self);
}

/// Waker paired with a [`FramePipe`](super::FramePipe).
///
/// The flag records the request; the socket pair interrupts a `poll(2)` that
/// is already in progress.
#[derive(Debug)]
pub struct PipeWaker {
    flag: AtomicBool,
    notify: UnixStream,
}

impl PipeWaker {
    pub(super) fn pair() -> io::Result<(Arc<Self>, UnixStream)> {
        let (notify, listen) = UnixStream::pair()?;
        notify.set_nonblocking(true)?;
        listen.set_nonblocking(true)?;
        let waker = Arc::new(Self {
            flag: AtomicBool::new(false),
            notify,
        });
        Ok((waker, listen))
    }

    /// Consumes a pending wake request.
    pub(super) fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    /// Reports whether a wake request is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl WorkerWaker for PipeWaker {
    fn wake(&self) {
        self.flag.store(true, Ordering::SeqCst);
        match (&self.notify).write(&[1]) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => {
                debug!(
                    target: TRANSPORT_TARGET,
                    error = %error,
                    "wake notification not delivered"
                );
            }
        }
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Discards queued wake bytes so the next `poll(2)` blocks again.
pub(super) fn drain(listen: &UnixStream) {
    let mut sink = [0_u8; 64];
    loop {
        match (&*listen).read(&mut sink) {
            Ok(0) => return,
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}
