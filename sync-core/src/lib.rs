//! Mirror Sync Core - shared types for the queue synchronization roles
//!
//! This crate provides the common types used by the master, syncer, and
//! mirror implementations: round correlators, message records, the backing
//! queue capability seam, credit-based flow control, and task liveness
//! monitoring.

#![warn(clippy::pedantic)]

pub mod credit;
pub mod error;
pub mod liveness;
pub mod queue;
pub mod record;
pub mod token;

pub use credit::{CreditConfig, CreditFlow};
pub use error::{StopReason, SyncHalt, SyncerPanicked};
pub use liveness::{LivenessGuard, Monitor, monitor};
pub use queue::{AckTags, BackingQueue, BqHook, FoldOutcome, FoldStep};
pub use record::{
    AckMap, Message, MessageRecord, Priority, Props, Publish, partition_publish_delivered_batch,
};
pub use token::{MessageId, RoundToken};
