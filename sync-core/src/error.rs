//! Error and stop-reason types shared across the sync roles.

use core::fmt;

use error_stack::Report;

/// Why an actor is being torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The surrounding queue process is exiting.
    ParentExited,
    /// The queue master was deleted out of band.
    MasterDeleted,
    /// The backing queue asked the fold to stop.
    BackingQueue(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ParentExited => f.write_str("parent queue process exited"),
            StopReason::MasterDeleted => f.write_str("queue master deleted"),
            StopReason::BackingQueue(reason) => write!(f, "backing queue stop: {reason}"),
        }
    }
}

impl core::error::Error for StopReason {}

/// Error context: the syncer crashed while a round was in progress.
#[derive(Debug)]
pub struct SyncerPanicked;

impl fmt::Display for SyncerPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("syncer crashed mid-round")
    }
}

impl core::error::Error for SyncerPanicked {}

/// Why the master's fold stopped before exhausting the queue snapshot.
#[derive(Debug)]
pub enum SyncHalt {
    /// The surrounding queue is dying.
    Shutdown(StopReason),
    /// The syncer crashed; the caller may retry with a new token.
    SyncerDied(Report<SyncerPanicked>),
    /// The control plane cancelled the round.
    Cancelled,
}
