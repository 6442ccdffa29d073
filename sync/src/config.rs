//! Sync round configuration.

use mirror_sync_core::CreditConfig;

/// Tuning for one sync round.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Records per batch handed to the syncer.
    pub batch_size: u64,
    /// Credit-flow parameters between the syncer and each mirror.
    pub credit: CreditConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            credit: CreditConfig::default(),
        }
    }
}
