//! Mirror-side sync loop and batch application.

use mirror_sync_core::{
    AckMap, AckTags, BackingQueue, CreditConfig, CreditFlow, Message, MessageRecord, Props,
    Publish, RoundToken, StopReason, partition_publish_delivered_batch,
};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::messages::{MirrorEvent, MirrorId, SyncerEvent, SyncerHandle};

/// Result of one sync round on a mirror.
#[derive(Debug)]
pub enum MirrorOutcome<T, Timer> {
    /// The mirror was already empty and opted out.
    Denied,
    /// Caught up. `ack_map` holds one entry per ack-tracked message, in
    /// the order the messages were republished.
    Ok { ack_map: AckMap<T>, timer: Timer },
    /// The syncer went down mid-round. The backing queue was purged; a
    /// later round can recover the mirror.
    Failed,
    /// The mirror itself is being torn down.
    Stopped(StopReason),
}

/// Everything a mirror needs for one round besides its backing queue.
pub struct MirrorArgs<'a, B: BackingQueue, Timer, R, H> {
    pub token: RoundToken,
    pub id: MirrorId,
    pub syncer: SyncerHandle,
    pub credit: CreditConfig,
    /// Current ram-duration timer, threaded through the round.
    pub timer: Timer,
    /// Refreshes the ram-duration timer on each tick.
    pub refresh_timer: R,
    /// Applies the file-handle cache cast.
    pub set_maximum_since_use: H,
    pub inbox: &'a mut mpsc::UnboundedReceiver<MirrorEvent<B>>,
    /// Parent queue process exit.
    pub shutdown: CancellationToken,
}

/// Take part in one sync round.
///
/// An empty mirror denies outright. Anyone else opts in, purges whatever
/// it held, and rebuilds its backing queue from the relayed batches until
/// the syncer either completes the round or dies.
#[instrument(skip_all, name = "mirror", fields(token = ?args.token, mirror = ?args.id))]
pub async fn run_mirror<B, Timer, R, H>(
    args: MirrorArgs<'_, B, Timer, R, H>,
    bq: &mut B,
) -> MirrorOutcome<B::AckTag, Timer>
where
    B: BackingQueue,
    R: FnMut(Timer) -> Timer + Send,
    H: FnMut(u64) + Send,
{
    let MirrorArgs {
        token,
        id,
        syncer,
        credit,
        mut timer,
        mut refresh_timer,
        mut set_maximum_since_use,
        inbox,
        shutdown,
    } = args;

    if bq.depth() == 0 {
        debug!("nothing to sync, denying");
        let _ = syncer.tx.send(SyncerEvent::SyncDeny { token, mirror: id });
        return MirrorOutcome::Denied;
    }

    let mut monitor = syncer.monitor.clone();
    let _ = syncer.tx.send(SyncerEvent::SyncReady { token, mirror: id });

    // A half-synced queue cannot be patched: a new master may carry
    // different tail messages, leaving a hole in the middle. Start from
    // nothing.
    let purged = bq.purge();
    bq.purge_acks();
    debug!(purged, "purged before sync");

    let mut credit = CreditFlow::new(credit);
    let mut ack_map: AckMap<B::AckTag> = Vec::new();

    loop {
        select! {
            // Inbox first: events sent before the syncer died (a final
            // batch, the completion broadcast) are handled in arrival
            // order, the way a single mailbox would.
            biased;
            ev = inbox.recv() => {
                let Some(ev) = ev else {
                    return MirrorOutcome::Stopped(StopReason::ParentExited);
                };
                match ev {
                    MirrorEvent::SyncMsgs { token: t, records } if t == token => {
                        if let Some(grant) = credit.ack(()) {
                            let _ = syncer.tx.send(SyncerEvent::BumpCredit {
                                mirror: id,
                                credit: grant,
                            });
                        }
                        apply_batch(bq, &records, &mut ack_map);
                    }
                    MirrorEvent::SyncMsgs { token: t, .. } => {
                        trace!(stale = ?t, "dropping batch from old round");
                    }
                    MirrorEvent::SyncComplete { token: t } if t == token => {
                        debug!(acked = ack_map.len(), "caught up");
                        return MirrorOutcome::Ok { ack_map, timer };
                    }
                    MirrorEvent::SyncComplete { token: t } => {
                        trace!(stale = ?t, "dropping completion from old round");
                    }
                    MirrorEvent::BumpCredit { credit: grant } => credit.handle_bump((), grant),
                    MirrorEvent::SetMaximumSinceUse(age) => set_maximum_since_use(age),
                    MirrorEvent::SetRamDurationTarget(target) => {
                        bq.set_ram_duration_target(target);
                    }
                    MirrorEvent::RunBackingQueue(hook) => bq.invoke(hook),
                    MirrorEvent::RamDurationTick => timer = refresh_timer(timer),
                    MirrorEvent::MasterTerminated(reason) => {
                        bq.delete_and_terminate(reason.clone());
                        return MirrorOutcome::Stopped(reason);
                    }
                }
            }
            () = monitor.down() => {
                warn!("syncer went down, purging");
                bq.purge();
                bq.purge_acks();
                return MirrorOutcome::Failed;
            }
            () = shutdown.cancelled() => {
                return MirrorOutcome::Stopped(StopReason::ParentExited);
            }
        }
    }
}

/// Split a batch into consecutive `unacked`-uniform runs, preserving
/// order, and republish each run through the matching fast path.
fn apply_batch<B: BackingQueue>(
    bq: &mut B,
    records: &[MessageRecord],
    ack_map: &mut AckMap<B::AckTag>,
) {
    let mut rest = records;
    while let Some(first) = rest.first() {
        let unacked = first.unacked;
        let run_len = rest.iter().take_while(|r| r.unacked == unacked).count();
        let (run, tail) = rest.split_at(run_len);
        if unacked {
            publish_delivered(bq, run, ack_map);
        } else {
            let batch = run
                .iter()
                .map(|record| Publish {
                    message: record.message.clone(),
                    // the master already dealt with publisher confirms
                    props: Props {
                        needs_confirming: false,
                        ..record.props
                    },
                    delivered: true,
                })
                .collect();
            bq.batch_publish(batch);
        }
        rest = tail;
    }
}

/// Republish an ack-tracked run and zip the returned handles onto the
/// records that produced them, flat or grouped per priority.
fn publish_delivered<B: BackingQueue>(
    bq: &mut B,
    run: &[MessageRecord],
    ack_map: &mut AckMap<B::AckTag>,
) {
    let batch: Vec<(Message, Props)> = run
        .iter()
        .map(|record| {
            (
                record.message.clone(),
                Props {
                    needs_confirming: false,
                    ..record.props
                },
            )
        })
        .collect();
    match bq.batch_publish_delivered(batch.clone()) {
        AckTags::Flat(tags) => {
            ack_map.extend(batch.iter().map(|(message, _)| message.id).zip(tags));
        }
        AckTags::ByPriority(groups) => {
            let mut by_priority = partition_publish_delivered_batch(&batch);
            for (priority, tags) in groups {
                let group = by_priority.remove(&priority).unwrap_or_default();
                ack_map.extend(group.into_iter().map(|(message, _)| message.id).zip(tags));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use mirror_sync_core::{FoldOutcome, FoldStep, MessageId, Priority};

    use super::*;

    #[derive(Default)]
    struct StubQueue {
        grouped_tags: bool,
        next_tag: u64,
        published: Vec<Publish>,
        delivered: Vec<(Message, Props)>,
        calls: Vec<&'static str>,
    }

    impl BackingQueue for StubQueue {
        type AckTag = u64;

        fn depth(&self) -> u64 {
            (self.published.len() + self.delivered.len()) as u64
        }

        async fn fold<A, F>(&mut self, _f: F, acc: A) -> FoldOutcome<A>
        where
            A: Send,
            F: AsyncFnMut(Message, Props, bool, A) -> FoldStep<A> + Send,
        {
            FoldOutcome::Done(acc)
        }

        fn purge(&mut self) -> u64 {
            self.calls.push("purge");
            let n = self.published.len() as u64;
            self.published.clear();
            n
        }

        fn purge_acks(&mut self) {
            self.calls.push("purge_acks");
            self.delivered.clear();
        }

        fn batch_publish(&mut self, batch: Vec<Publish>) {
            self.calls.push("publish");
            self.published.extend(batch);
        }

        fn batch_publish_delivered(&mut self, batch: Vec<(Message, Props)>) -> AckTags<u64> {
            self.calls.push("publish_delivered");
            let tags = if self.grouped_tags {
                let mut groups = Vec::new();
                for (priority, records) in partition_publish_delivered_batch(&batch) {
                    let mut group = Vec::new();
                    for _ in &records {
                        group.push((u64::from(priority) << 32) | self.next_tag);
                        self.next_tag += 1;
                    }
                    groups.push((priority, group));
                }
                AckTags::ByPriority(groups)
            } else {
                let mut flat = Vec::new();
                for _ in &batch {
                    flat.push(self.next_tag);
                    self.next_tag += 1;
                }
                AckTags::Flat(flat)
            };
            self.delivered.extend(batch);
            tags
        }

        fn set_ram_duration_target(&mut self, _target: Option<Duration>) {}

        fn delete_and_terminate(&mut self, _reason: StopReason) {}
    }

    fn rec(priority: Priority, unacked: bool) -> MessageRecord {
        MessageRecord {
            message: Message::new(priority, Bytes::from_static(b"m")),
            props: Props {
                needs_confirming: true,
                size: 1,
            },
            unacked,
        }
    }

    fn ids(records: &[MessageRecord]) -> Vec<MessageId> {
        records.iter().map(|r| r.message.id).collect()
    }

    #[test]
    fn runs_are_partitioned_consecutively_in_order() {
        let records = vec![rec(0, false), rec(0, false), rec(0, true), rec(0, false)];
        let mut bq = StubQueue::default();
        let mut ack_map = Vec::new();

        apply_batch(&mut bq, &records, &mut ack_map);

        assert_eq!(bq.calls, vec!["publish", "publish_delivered", "publish"]);
        let published: Vec<_> = bq.published.iter().map(|p| p.message.id).collect();
        assert_eq!(
            published,
            vec![records[0].message.id, records[1].message.id, records[3].message.id]
        );
        assert_eq!(ids(&records[2..3]), vec![bq.delivered[0].0.id]);
    }

    #[test]
    fn regular_records_are_rewritten_as_delivered() {
        let records = vec![rec(0, false)];
        let mut bq = StubQueue::default();
        let mut ack_map = Vec::new();

        apply_batch(&mut bq, &records, &mut ack_map);

        assert!(bq.published[0].delivered);
        assert!(!bq.published[0].props.needs_confirming);
        assert_eq!(bq.published[0].props.size, 1);
        assert!(ack_map.is_empty());
    }

    #[test]
    fn ack_tracked_records_have_confirms_cleared() {
        let records = vec![rec(0, true)];
        let mut bq = StubQueue::default();
        let mut ack_map = Vec::new();

        apply_batch(&mut bq, &records, &mut ack_map);

        assert!(!bq.delivered[0].1.needs_confirming);
    }

    #[test]
    fn flat_tags_zip_elementwise() {
        let records = vec![rec(0, true), rec(0, true)];
        let mut bq = StubQueue::default();
        let mut ack_map = Vec::new();

        apply_batch(&mut bq, &records, &mut ack_map);

        assert_eq!(
            ack_map,
            vec![(records[0].message.id, 0), (records[1].message.id, 1)]
        );
    }

    #[test]
    fn grouped_tags_zip_per_priority_group() {
        let records = vec![rec(7, true), rec(0, true), rec(7, true)];
        let mut bq = StubQueue {
            grouped_tags: true,
            ..StubQueue::default()
        };
        let mut ack_map = Vec::new();

        apply_batch(&mut bq, &records, &mut ack_map);

        // groups come back in ascending priority order: [m2] then [m1, m3]
        assert_eq!(
            ack_map,
            vec![
                (records[1].message.id, 0),
                (records[0].message.id, (7 << 32) | 1),
                (records[2].message.id, (7 << 32) | 2),
            ]
        );
    }
}
