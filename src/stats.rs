//! Process-wide protocol counters.
//!
//! Shared between the engine and the connection reader tasks (which
//! count framing errors before the engine ever sees the line), so the
//! counters are atomics behind one `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for the replication engine.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Lines received across all connections.
    pub lines_in: AtomicU64,
    /// Lines queued for sending.
    pub lines_out: AtomicU64,
    /// Lines dropped for parse errors.
    pub parse_errors: AtomicU64,
    /// Peer lines dropped for an unknown numnick prefix.
    pub unknown_prefix: AtomicU64,
    /// KILLs issued by this server (collisions included).
    pub kills: AtomicU64,
    /// Connections refused (limits, bans, bad handshake).
    pub refused: AtomicU64,
    /// Connections killed for SendQ overflow.
    pub sendq_kills: AtomicU64,
    /// Connections exited on ping timeout.
    pub ping_timeouts: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Relaxed increment; the counters are diagnostics, not control flow.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump() {
        let stats = ServerStats::new();
        bump(&stats.kills);
        bump(&stats.kills);
        assert_eq!(stats.kills.load(Ordering::Relaxed), 2);
    }
}
