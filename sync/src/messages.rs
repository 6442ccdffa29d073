//! Protocol events exchanged between the three sync roles.

use core::fmt;
use std::time::Duration;

use mirror_sync_core::{
    BackingQueue, BqHook, MessageRecord, Monitor, RoundToken, StopReason,
};
use tokio::sync::{mpsc, oneshot};

/// Identifies one candidate mirror within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirrorId(pub u64);

/// Events consumed by the master during a round.
#[derive(Debug)]
pub enum MasterEvent {
    /// Syncer: at least one mirror opted in; the fold may begin.
    Ready,
    /// Syncer: the previous batch is fully relayed; send the next one.
    Next(RoundToken),
    /// Control plane: stop the round. Replied to only once the syncer is
    /// stopped, so no further batches can surface after the reply.
    Cancel { reply: oneshot::Sender<()> },
    /// Administrative cast for the file-handle cache.
    SetMaximumSinceUse(u64),
}

/// Events consumed by the syncer.
#[derive(Debug)]
pub enum SyncerEvent {
    /// Mirror opts in to the round.
    SyncReady { token: RoundToken, mirror: MirrorId },
    /// Mirror declares itself already synced.
    SyncDeny { token: RoundToken, mirror: MirrorId },
    /// Credit grant from a mirror.
    BumpCredit { mirror: MirrorId, credit: u32 },
    /// Master: one batch to relay.
    Batch {
        token: RoundToken,
        records: Vec<MessageRecord>,
    },
    /// Master: the snapshot is exhausted.
    Done { token: RoundToken },
    /// Master: the round is cancelled; exit without telling the mirrors
    /// (they observe the death and recover by purging).
    Cancel { token: RoundToken },
}

/// Events consumed by a mirror while syncing.
pub enum MirrorEvent<B: BackingQueue> {
    /// One batch of records to republish.
    SyncMsgs {
        token: RoundToken,
        records: Vec<MessageRecord>,
    },
    /// The round is over; the mirror is caught up.
    SyncComplete { token: RoundToken },
    /// Credit grant from a downstream peer.
    BumpCredit { credit: u32 },
    /// Administrative cast for the file-handle cache.
    SetMaximumSinceUse(u64),
    /// Administrative cast applied to the backing queue.
    SetRamDurationTarget(Option<Duration>),
    /// Run a hook against the backing queue.
    RunBackingQueue(BqHook<B>),
    /// Refresh the ram-duration timer.
    RamDurationTick,
    /// The master was deleted out of band; tear the local queue down.
    MasterTerminated(StopReason),
}

impl<B: BackingQueue> fmt::Debug for MirrorEvent<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorEvent::SyncMsgs { token, records } => f
                .debug_struct("SyncMsgs")
                .field("token", token)
                .field("records", &records.len())
                .finish(),
            MirrorEvent::SyncComplete { token } => {
                f.debug_struct("SyncComplete").field("token", token).finish()
            }
            MirrorEvent::BumpCredit { credit } => {
                f.debug_struct("BumpCredit").field("credit", credit).finish()
            }
            MirrorEvent::SetMaximumSinceUse(age) => {
                f.debug_tuple("SetMaximumSinceUse").field(age).finish()
            }
            MirrorEvent::SetRamDurationTarget(target) => {
                f.debug_tuple("SetRamDurationTarget").field(target).finish()
            }
            MirrorEvent::RunBackingQueue(_) => f.write_str("RunBackingQueue"),
            MirrorEvent::RamDurationTick => f.write_str("RamDurationTick"),
            MirrorEvent::MasterTerminated(reason) => {
                f.debug_tuple("MasterTerminated").field(reason).finish()
            }
        }
    }
}

/// Send side of a mirror's sync inbox plus its liveness monitor.
pub struct MirrorHandle<B: BackingQueue> {
    pub id: MirrorId,
    pub tx: mpsc::UnboundedSender<MirrorEvent<B>>,
    pub monitor: Monitor,
}

impl<B: BackingQueue> Clone for MirrorHandle<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

impl<B: BackingQueue> fmt::Debug for MirrorHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Send side of the syncer's inbox plus its liveness monitor.
#[derive(Debug, Clone)]
pub struct SyncerHandle {
    pub tx: mpsc::UnboundedSender<SyncerEvent>,
    pub monitor: Monitor,
}
