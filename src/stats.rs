//! Pluggable counter sink. Every hook defaults to a no-op so implementors
//! pick only the counters they care about; calls come from both loops and
//! must not block.

pub trait WireStats: Send + Sync {
    fn frames_sent(&self, _count: usize) {}
    fn frames_received(&self, _count: usize) {}
    fn heartbeat_sent(&self) {}
    fn heartbeat_received(&self) {}
    fn message_delivered(&self) {}
    fn invalid_message(&self) {}
    fn handshake_established(&self) {}
    fn handshake_failed(&self) {}
    fn host_declared_dead(&self) {}
}

/// Sink used when construction supplies none.
pub(crate) struct NullStats;

impl WireStats for NullStats {}
