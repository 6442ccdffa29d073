//! Mirror Sync - queue replica synchronization protocol
//!
//! This crate implements the protocol that brings freshly-joined or
//! freshly-promoted queue mirrors up to date with the queue master without
//! disrupting live publish/consume traffic on the master.
//!
//! # Architecture
//!
//! - **Master**: owns the authoritative queue and folds its snapshot into
//!   bounded batches ([`run_master`])
//! - **Syncer**: one-shot intermediary spawned by the master; it
//!   negotiates which mirrors take part and relays batches under
//!   credit-based flow control
//! - **Mirror**: purges its backing queue and rebuilds it from the batches
//!   ([`run_mirror`])
//!
//! One batch is in flight at a time: the master sends the next batch only
//! after the syncer asks for it, so cancellation drains a bounded amount
//! of work.

#![warn(clippy::pedantic)]

pub mod bus;
pub mod config;
pub mod master;
pub mod messages;
pub mod metrics;
pub mod mirror;
pub mod observer;
mod syncer;

pub use bus::{MembershipBus, SyncStart};
pub use config::SyncConfig;
pub use master::{MasterArgs, SyncOutcome, run_master};
pub use messages::{MasterEvent, MirrorEvent, MirrorHandle, MirrorId, SyncerEvent, SyncerHandle};
pub use metrics::SyncMetrics;
pub use mirror::{MirrorArgs, MirrorOutcome, run_mirror};
pub use observer::SyncObserver;
