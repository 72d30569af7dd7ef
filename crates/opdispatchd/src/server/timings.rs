//! Protocol deadlines used by both ends of a dispatch connection.

use std::time::Duration;

/// Deadlines for each phase of the dispatch protocol.
///
/// The defaults suit production. Tests shorten them to exercise timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimings {
    /// How long the server waits for `authenticate` on a new connection.
    pub authenticate: Duration,
    /// How long the server waits for `acknowledge_operation`.
    pub acknowledge: Duration,
    /// How long the server waits for `done_operation`.
    pub execution: Duration,
    /// Unit of the idle poll interval; worker `n` polls every `(10 + n)` units.
    pub idle_poll_unit: Duration,
}

impl ProtocolTimings {
    const IDLE_POLL_OFFSET: u32 = 10;

    /// Idle receive interval for a worker slot. Staggered per slot so idle
    /// connections do not all wake together.
    #[must_use]
    pub fn idle_poll(&self, worker: usize) -> Duration {
        let multiplier = u32::try_from(worker)
            .unwrap_or(u32::MAX)
            .saturating_add(Self::IDLE_POLL_OFFSET);
        self.idle_poll_unit.saturating_mul(multiplier)
    }
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            authenticate: Duration::from_millis(2000),
            acknowledge: Duration::from_millis(500),
            execution: Duration::from_secs(60),
            idle_poll_unit: Duration::from_millis(2000),
        }
    }
}
