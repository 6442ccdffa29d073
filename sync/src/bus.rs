//! Membership bus seam.

use mirror_sync_core::RoundToken;

use crate::messages::SyncerHandle;

/// Round-start announcement broadcast to every candidate mirror.
#[derive(Debug, Clone)]
pub struct SyncStart {
    pub token: RoundToken,
    pub syncer: SyncerHandle,
}

/// Ordered broadcast channel used to initiate a round.
///
/// Implementations must deliver [`SyncStart`] to every candidate mirror
/// ordered *behind* every message previously broadcast by the same sender,
/// so a mirror's pre-sync mailbox is drained before the round begins.
pub trait MembershipBus: Send + 'static {
    fn broadcast_sync_start(&self, start: SyncStart);
}
