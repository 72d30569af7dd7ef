//! Loopback TCP transport between the dispatcher and its workers.
//!
//! [`SocketListener`] accepts worker connections on a background thread and
//! hands each one to a [`ConnectionHandler`]. Both sides then exchange
//! length-prefixed JSON frames over a [`FramePipe`].

mod errors;
mod handler;
mod listener;
mod pipe;
mod poll;
#[cfg(test)]
mod test_utils;
mod wake;

pub use self::errors::{ListenerError, PipeError};
pub use self::handler::ConnectionHandler;
pub use self::listener::{ListenerHandle, SocketListener};
pub use self::pipe::{FRAME_CAPACITY, FramePipe, RECEIVE_GRACE};
pub use self::wake::{PipeWaker, WorkerWaker};
#[cfg(test)]
pub(crate) use self::test_utils::CountingHandler;

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
