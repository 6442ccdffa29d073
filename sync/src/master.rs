//! Master-side driver for one sync round.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::Report;
use mirror_sync_core::{
    BackingQueue, FoldOutcome, FoldStep, MessageRecord, RoundToken, StopReason, SyncHalt,
    SyncerPanicked, monitor,
};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::bus::MembershipBus;
use crate::config::SyncConfig;
use crate::messages::{MasterEvent, MirrorHandle, SyncerEvent, SyncerHandle};
use crate::metrics::SyncMetrics;
use crate::observer::SyncObserver;
use crate::syncer::{self, SyncerArgs, SyncerExit};

/// Progress stats cadence, measured in monotonic time.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one sync round at the master/caller boundary.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Every mirror denied; no state changed anywhere.
    AlreadySynced,
    /// The round completed; the mirrors carry a fresh ack-map.
    Ok,
    /// The surrounding queue is dying.
    Shutdown(StopReason),
    /// The syncer crashed mid-round. The caller may retry with a new
    /// token; the mirrors recover by purging.
    SyncerDied(Report<SyncerPanicked>),
    /// The control plane cancelled the round.
    Cancelled,
}

impl From<SyncHalt> for SyncOutcome {
    fn from(halt: SyncHalt) -> Self {
        match halt {
            SyncHalt::Shutdown(reason) => SyncOutcome::Shutdown(reason),
            SyncHalt::SyncerDied(report) => SyncOutcome::SyncerDied(report),
            SyncHalt::Cancelled => SyncOutcome::Cancelled,
        }
    }
}

/// Everything one sync round needs besides the backing queue itself.
pub struct MasterArgs<'a, B: BackingQueue, Bus, O> {
    pub token: RoundToken,
    pub config: SyncConfig,
    /// Bus the syncer announces the round on.
    pub bus: Bus,
    /// Candidate mirrors to bring up to date.
    pub mirrors: Vec<MirrorHandle<B>>,
    pub observer: &'a mut O,
    /// The master's own inbox; the control plane feeds it too.
    pub inbox: &'a mut mpsc::UnboundedReceiver<MasterEvent>,
    /// Send side of `inbox`, handed to the syncer for `Ready`/`Next`.
    pub self_tx: mpsc::UnboundedSender<MasterEvent>,
    /// Parent queue process exit.
    pub shutdown: CancellationToken,
    pub metrics: Arc<SyncMetrics>,
}

/// Link to the spawned syncer: dropping it aborts the task, so the
/// master's death kills the syncer, while the syncer's own death is
/// observed through the join handle.
struct SyncerLink {
    tx: mpsc::UnboundedSender<SyncerEvent>,
    join: JoinHandle<SyncerExit>,
}

impl Drop for SyncerLink {
    fn drop(&mut self) {
        self.join.abort();
    }
}

impl SyncerLink {
    /// Cancel the syncer and wait until it is gone. Only after this may a
    /// cancel request be answered: no further batches can surface.
    async fn stop(&mut self, token: RoundToken) {
        let _ = self.tx.send(SyncerEvent::Cancel { token });
        let _ = (&mut self.join).await;
    }
}

fn died(err: JoinError) -> Report<SyncerPanicked> {
    Report::new(err).change_context(SyncerPanicked)
}

fn unexpected_exit(exit: SyncerExit) -> Report<SyncerPanicked> {
    Report::new(SyncerPanicked).attach_printable(format!("unexpected syncer exit: {exit:?}"))
}

enum Gate {
    Proceed,
    Halt(SyncHalt),
}

/// Park until the syncer asks for the next batch. Administrative casts are
/// applied as they arrive so the file-handle cache is never starved behind
/// a long wait; cancel, parent exit, and syncer death all end the round.
async fn wait_for_next<O: SyncObserver>(
    token: RoundToken,
    inbox: &mut mpsc::UnboundedReceiver<MasterEvent>,
    link: &mut SyncerLink,
    observer: &mut O,
    shutdown: &CancellationToken,
) -> Gate {
    loop {
        select! {
            ev = inbox.recv() => match ev {
                Some(MasterEvent::Next(t)) if t == token => return Gate::Proceed,
                Some(MasterEvent::Next(_) | MasterEvent::Ready) => {}
                Some(MasterEvent::SetMaximumSinceUse(age)) => observer.set_maximum_since_use(age),
                Some(MasterEvent::Cancel { reply }) => {
                    link.stop(token).await;
                    let _ = reply.send(());
                    return Gate::Halt(SyncHalt::Cancelled);
                }
                None => return Gate::Halt(SyncHalt::Shutdown(StopReason::ParentExited)),
            },
            res = &mut link.join => {
                return Gate::Halt(SyncHalt::SyncerDied(match res {
                    Ok(exit) => unexpected_exit(exit),
                    Err(err) => died(err),
                }));
            }
            () = shutdown.cancelled() => {
                return Gate::Halt(SyncHalt::Shutdown(StopReason::ParentExited));
            }
        }
    }
}

/// Apply queued administrative casts without blocking, immediately before
/// a batch goes out, so the file-handle cache cast is never stuck behind a
/// fold in progress. A queued cancel wins over sending the batch.
async fn drain_casts<O: SyncObserver>(
    token: RoundToken,
    inbox: &mut mpsc::UnboundedReceiver<MasterEvent>,
    link: &mut SyncerLink,
    observer: &mut O,
) -> Gate {
    loop {
        match inbox.try_recv() {
            Ok(MasterEvent::SetMaximumSinceUse(age)) => observer.set_maximum_since_use(age),
            Ok(MasterEvent::Cancel { reply }) => {
                link.stop(token).await;
                let _ = reply.send(());
                return Gate::Halt(SyncHalt::Cancelled);
            }
            Ok(MasterEvent::Ready | MasterEvent::Next(_)) => {}
            Err(_) => return Gate::Proceed,
        }
    }
}

struct FoldAcc {
    curr: u64,
    batch: Vec<MessageRecord>,
}

/// Execute one sync round against the given backing queue.
///
/// Spawns a syncer bound to the same round token, waits for it to
/// negotiate with the candidate mirrors, then folds over the queue
/// snapshot handing batches to the syncer. Live traffic on the queue is
/// untouched: each batch is gated by an explicit `Next` from the syncer,
/// so at most one batch is in flight and a cancel drains bounded work.
#[instrument(skip_all, name = "sync_master", fields(token = ?args.token))]
pub async fn run_master<B, Bus, O>(args: MasterArgs<'_, B, Bus, O>, bq: &mut B) -> SyncOutcome
where
    B: BackingQueue,
    Bus: MembershipBus,
    O: SyncObserver,
{
    let MasterArgs {
        token,
        config,
        bus,
        mirrors,
        observer,
        inbox,
        self_tx,
        shutdown,
        metrics,
    } = args;

    let (guard, syncer_monitor) = monitor();
    let (syncer_tx, syncer_inbox) = mpsc::unbounded_channel();
    let join = tokio::spawn(syncer::run_syncer(SyncerArgs {
        token,
        bus,
        master: self_tx,
        inbox: syncer_inbox,
        handle: SyncerHandle {
            tx: syncer_tx.clone(),
            monitor: syncer_monitor,
        },
        mirrors,
        credit: config.credit,
        metrics: metrics.clone(),
        guard,
    }));
    let mut link = SyncerLink {
        tx: syncer_tx,
        join,
    };

    // Prepare: wait for the syncer's verdict on whether anyone wants sync.
    loop {
        select! {
            ev = inbox.recv() => match ev {
                Some(MasterEvent::Ready) => break,
                Some(MasterEvent::SetMaximumSinceUse(age)) => observer.set_maximum_since_use(age),
                Some(MasterEvent::Cancel { reply }) => {
                    link.stop(token).await;
                    let _ = reply.send(());
                    return SyncOutcome::Cancelled;
                }
                Some(MasterEvent::Next(_)) => {}
                None => return SyncOutcome::Shutdown(StopReason::ParentExited),
            },
            res = &mut link.join => {
                return match res {
                    Ok(_) => SyncOutcome::AlreadySynced,
                    Err(err) => SyncOutcome::SyncerDied(died(err)),
                };
            }
            () = shutdown.cancelled() => {
                return SyncOutcome::Shutdown(StopReason::ParentExited);
            }
        }
    }

    let len = bq.depth();
    let batch_size = config.batch_size.max(1);
    let mut sent: u64 = 0;
    let mut last_stats = Instant::now();

    observer.emit_stats(0);
    debug!(len, "sync started");
    metrics.rounds_started_total.inc();

    let outcome = bq
        .fold(
            async |message, props, unacked, mut acc: FoldAcc| {
                acc.curr += 1;
                acc.batch.push(MessageRecord {
                    message,
                    props,
                    unacked,
                });
                if acc.curr == len || acc.curr % batch_size == 0 {
                    if last_stats.elapsed() > STATS_INTERVAL {
                        observer.emit_stats(sent);
                        debug!(syncing = sent, "sync progress");
                        last_stats = Instant::now();
                    }
                    match wait_for_next(token, inbox, &mut link, observer, &shutdown).await {
                        Gate::Proceed => {}
                        Gate::Halt(halt) => return FoldStep::Stop(halt),
                    }
                    match drain_casts(token, inbox, &mut link, observer).await {
                        Gate::Proceed => {}
                        Gate::Halt(halt) => return FoldStep::Stop(halt),
                    }
                    let records = mem::take(&mut acc.batch);
                    sent += records.len() as u64;
                    metrics.messages_synced_total.inc_by(records.len() as u64);
                    let _ = link.tx.send(SyncerEvent::Batch { token, records });
                    observer.handle_info(sent);
                }
                FoldStep::Cont(acc)
            },
            FoldAcc {
                curr: 0,
                batch: Vec::new(),
            },
        )
        .await;

    let acc = match outcome {
        FoldOutcome::Done(acc) => acc,
        FoldOutcome::Halted(halt) => return halt.into(),
    };

    // A snapshot shorter than the depth estimate leaves a partial batch.
    if !acc.batch.is_empty() {
        match wait_for_next(token, inbox, &mut link, observer, &shutdown).await {
            Gate::Proceed => {}
            Gate::Halt(halt) => return halt.into(),
        }
        match drain_casts(token, inbox, &mut link, observer).await {
            Gate::Proceed => {}
            Gate::Halt(halt) => return halt.into(),
        }
        sent += acc.batch.len() as u64;
        metrics.messages_synced_total.inc_by(acc.batch.len() as u64);
        let _ = link.tx.send(SyncerEvent::Batch {
            token,
            records: acc.batch,
        });
        observer.handle_info(sent);
    }

    // Completion: one final `Next` confirms the last batch was relayed,
    // then the syncer broadcasts completion and terminates.
    match wait_for_next(token, inbox, &mut link, observer, &shutdown).await {
        Gate::Proceed => {}
        Gate::Halt(halt) => return halt.into(),
    }
    let _ = link.tx.send(SyncerEvent::Done { token });
    match (&mut link.join).await {
        Ok(_) => {
            metrics.rounds_completed_total.inc();
            debug!(synced = sent, "sync round complete");
            SyncOutcome::Ok
        }
        Err(err) => SyncOutcome::SyncerDied(died(err)),
    }
}
