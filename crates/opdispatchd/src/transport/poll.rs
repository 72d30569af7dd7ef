//! Readiness waits built on `poll(2)`.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Socket readiness the caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Interest {
    Readable,
    Writable,
}

/// Descriptors that became ready during a wait.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Readiness {
    pub(super) socket: bool,
    pub(super) wake: bool,
}

/// Blocks until the socket is ready, the wake descriptor is readable, or the
/// timeout elapses. Signal interruptions are reported as "nothing ready".
pub(super) fn wait(
    socket: RawFd,
    interest: Interest,
    wake: Option<RawFd>,
    timeout: Duration,
) -> io::Result<Readiness> {
    let events = match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
    };
    // Negative descriptors are ignored by poll(2).
    let mut fds = [
        libc::pollfd {
            fd: socket,
            events,
            revents: 0,
        },
        libc::pollfd {
            fd: wake.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let millis = libc::c_int::try_from(timeout.as_millis().max(1)).unwrap_or(libc::c_int::MAX);
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if ready < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::default());
        }
        return Err(error);
    }
    let [socket_fd, wake_fd] = fds;
    Ok(Readiness {
        // Hang-ups and errors count as ready so the next read surfaces them.
        socket: socket_fd.revents != 0,
        wake: wake_fd.revents & libc::POLLIN != 0,
    })
}
