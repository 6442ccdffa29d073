//! Prometheus metrics for sync rounds.

use measured::{Counter, MetricGroup};

/// Counters covering the lifecycle of sync rounds.
#[derive(MetricGroup)]
#[metric(new())]
pub struct SyncMetrics {
    /// Rounds that reached the fold phase.
    pub rounds_started_total: Counter,
    /// Rounds that completed with a `SyncComplete` broadcast.
    pub rounds_completed_total: Counter,
    /// Batches relayed towards the mirrors.
    pub batches_forwarded_total: Counter,
    /// Messages handed to the syncer.
    pub messages_synced_total: Counter,
    /// Mirrors dropped from a round after a down event.
    pub mirrors_lost_total: Counter,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}
