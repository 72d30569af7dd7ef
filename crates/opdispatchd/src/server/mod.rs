//! Server side of the dispatch protocol.
//!
//! Each accepted worker connection runs on its own thread. The thread
//! authenticates the worker, claims its slot in the [`Dispatcher`], then
//! alternates between asking the dispatcher for work and waiting on the
//! worker, handing every outcome back to the dispatcher.
//!
//! [`Dispatcher`]: crate::dispatcher::Dispatcher

mod auth;
mod connection;
mod errors;
mod timings;

pub use self::connection::DispatchConnectionHandler;
pub use self::errors::ConnectionError;
pub use self::timings::ProtocolTimings;

pub(crate) const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");
