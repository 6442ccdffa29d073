//! One-shot relay between the master and its mirrors.
//!
//! Isolating the per-mirror monitors and credit bookkeeping in a separate
//! task keeps mirror failures out of the master's inbox and leaves the
//! master's own flow-control state free for live traffic.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use mirror_sync_core::{BackingQueue, CreditConfig, CreditFlow, LivenessGuard, RoundToken};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::bus::{MembershipBus, SyncStart};
use crate::messages::{MasterEvent, MirrorEvent, MirrorHandle, MirrorId, SyncerEvent, SyncerHandle};
use crate::metrics::SyncMetrics;

/// How the syncer finished. Crashes surface as join errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncerExit {
    /// Every candidate denied or was down before the round started.
    AlreadySynced,
    /// The round completed and `SyncComplete` was broadcast.
    Done,
    /// The master cancelled the round, or went away entirely. Mirrors are
    /// not told; they observe the death and recover by purging.
    Cancelled,
}

pub(crate) struct SyncerArgs<B: BackingQueue, Bus> {
    pub token: RoundToken,
    pub bus: Bus,
    pub master: mpsc::UnboundedSender<MasterEvent>,
    pub inbox: mpsc::UnboundedReceiver<SyncerEvent>,
    /// This syncer's own address, announced to the mirrors.
    pub handle: SyncerHandle,
    pub mirrors: Vec<MirrorHandle<B>>,
    pub credit: CreditConfig,
    pub metrics: Arc<SyncMetrics>,
    /// Dropped on exit; master and mirrors observe it.
    pub guard: LivenessGuard,
}

#[instrument(skip_all, name = "syncer", fields(token = ?args.token))]
pub(crate) async fn run_syncer<B, Bus>(args: SyncerArgs<B, Bus>) -> SyncerExit
where
    B: BackingQueue,
    Bus: MembershipBus,
{
    let SyncerArgs {
        token,
        bus,
        master,
        mut inbox,
        handle,
        mirrors,
        credit,
        metrics,
        guard,
    } = args;
    let _guard = guard;

    // Routed over the membership bus so it is ordered behind every prior
    // broadcast from the master: each mirror's pre-sync mailbox is drained
    // before the round begins.
    bus.broadcast_sync_start(SyncStart {
        token,
        syncer: handle,
    });

    let mut downs = FuturesUnordered::new();
    let mut pending: Vec<MirrorHandle<B>> = Vec::new();
    for mirror in mirrors {
        if mirror.monitor.is_down() {
            debug!(mirror = ?mirror.id, "candidate not running, skipping");
            continue;
        }
        let mut mon = mirror.monitor.clone();
        let id = mirror.id;
        downs.push(async move {
            mon.down().await;
            id
        });
        pending.push(mirror);
    }

    let mut credit = CreditFlow::new(credit);
    let mut live: Vec<MirrorHandle<B>> = Vec::new();

    // Negotiation: every candidate opts in, opts out, or goes down.
    while !pending.is_empty() {
        select! {
            ev = inbox.recv() => match ev {
                Some(SyncerEvent::SyncReady { token: t, mirror }) if t == token => {
                    if let Some(at) = pending.iter().position(|m| m.id == mirror) {
                        trace!(?mirror, "mirror ready");
                        live.push(pending.swap_remove(at));
                    }
                }
                Some(SyncerEvent::SyncDeny { token: t, mirror }) if t == token => {
                    if let Some(at) = pending.iter().position(|m| m.id == mirror) {
                        debug!(?mirror, "mirror denied sync");
                        pending.swap_remove(at);
                    }
                }
                Some(SyncerEvent::Cancel { token: t }) if t == token => {
                    trace!("cancelled during negotiation");
                    return SyncerExit::Cancelled;
                }
                Some(SyncerEvent::BumpCredit { mirror, credit: grant }) => {
                    credit.handle_bump(mirror, grant);
                }
                Some(_) => {}
                None => return SyncerExit::Cancelled,
            },
            Some(id) = downs.next() => {
                if remove_mirror(&mut pending, id) || remove_mirror(&mut live, id) {
                    warn!(mirror = ?id, "mirror went down");
                    credit.peer_down(id);
                    metrics.mirrors_lost_total.inc();
                }
            }
        }
    }

    if live.is_empty() {
        debug!("all mirrors already synced");
        return SyncerExit::AlreadySynced;
    }

    if master.send(MasterEvent::Ready).is_err() {
        return SyncerExit::Cancelled;
    }
    debug!(mirrors = live.len(), "relaying");

    loop {
        if master.send(MasterEvent::Next(token)).is_err() {
            return SyncerExit::Cancelled;
        }

        let records = loop {
            select! {
                ev = inbox.recv() => match ev {
                    Some(SyncerEvent::Batch { token: t, records }) if t == token => break records,
                    Some(SyncerEvent::Done { token: t }) if t == token => {
                        for mirror in &live {
                            let _ = mirror.tx.send(MirrorEvent::SyncComplete { token });
                        }
                        debug!("sync complete broadcast");
                        return SyncerExit::Done;
                    }
                    Some(SyncerEvent::Cancel { token: t }) if t == token => {
                        trace!("cancelled");
                        return SyncerExit::Cancelled;
                    }
                    Some(SyncerEvent::BumpCredit { mirror, credit: grant }) => {
                        credit.handle_bump(mirror, grant);
                    }
                    Some(_) => {}
                    None => return SyncerExit::Cancelled,
                },
                Some(id) = downs.next() => {
                    if remove_mirror(&mut live, id) {
                        warn!(mirror = ?id, "mirror went down mid-round");
                        credit.peer_down(id);
                        metrics.mirrors_lost_total.inc();
                    }
                }
            }
        };

        // Park until every live mirror can take the batch. Only credit
        // bumps, down events, and a cancel move this state.
        while credit.blocked() {
            trace!("credit exhausted, waiting");
            select! {
                ev = inbox.recv() => match ev {
                    Some(SyncerEvent::BumpCredit { mirror, credit: grant }) => {
                        credit.handle_bump(mirror, grant);
                    }
                    Some(SyncerEvent::Cancel { token: t }) if t == token => {
                        trace!("cancelled while blocked");
                        return SyncerExit::Cancelled;
                    }
                    Some(_) => {}
                    None => return SyncerExit::Cancelled,
                },
                Some(id) = downs.next() => {
                    if remove_mirror(&mut live, id) {
                        warn!(mirror = ?id, "mirror went down while blocked");
                        credit.peer_down(id);
                        metrics.mirrors_lost_total.inc();
                    }
                }
            }
        }

        live.retain(|mirror| {
            let event = MirrorEvent::SyncMsgs {
                token,
                records: records.clone(),
            };
            if mirror.tx.send(event).is_ok() {
                credit.send(mirror.id);
                true
            } else {
                // closed inbox, same as a down notification
                warn!(mirror = ?mirror.id, "mirror unreachable, dropping");
                credit.peer_down(mirror.id);
                metrics.mirrors_lost_total.inc();
                false
            }
        });
        metrics.batches_forwarded_total.inc();
    }
}

fn remove_mirror<B: BackingQueue>(set: &mut Vec<MirrorHandle<B>>, id: MirrorId) -> bool {
    match set.iter().position(|m| m.id == id) {
        Some(at) => {
            set.swap_remove(at);
            true
        }
        None => false,
    }
}
