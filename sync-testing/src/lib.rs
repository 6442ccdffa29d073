//! Mirror Sync Testing - test utilities and integration tests
//!
//! This crate provides the doubles the integration tests drive the sync
//! protocol with: an in-memory backing queue that records every call it
//! receives in order, a membership bus delivering round-start broadcasts
//! to registered mirror processes, and helpers for spawning mirrors the
//! way a surrounding queue process would.

#![warn(clippy::pedantic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mirror_sync::{
    MasterArgs, MasterEvent, MembershipBus, MirrorArgs, MirrorEvent, MirrorHandle, MirrorId,
    MirrorOutcome, SyncConfig, SyncMetrics, SyncObserver, SyncOutcome, SyncStart, SyncerEvent,
    SyncerHandle, run_master, run_mirror,
};
use mirror_sync_core::{
    AckTags, BackingQueue, CreditConfig, FoldOutcome, FoldStep, LivenessGuard, Message, MessageId,
    MessageRecord, Priority, Props, Publish, RoundToken, StopReason, monitor,
    partition_publish_delivered_batch,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses the `RUST_LOG` env var for filtering (defaults to "debug" for the
/// sync crates).
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mirror_sync=debug")),
        )
        .with_test_writer()
        .finish();

    // Set as the default for this thread only so parallel tests keep
    // their own output.
    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

/// Build a regular record with default priority.
#[must_use]
pub fn record(unacked: bool) -> MessageRecord {
    record_with_priority(0, unacked)
}

/// Build a record carrying the given priority. Confirms start pending so
/// the tests can observe them being cleared on the mirror.
#[must_use]
pub fn record_with_priority(priority: Priority, unacked: bool) -> MessageRecord {
    MessageRecord {
        message: Message::new(priority, Bytes::from_static(b"payload")),
        props: Props {
            needs_confirming: true,
            size: 7,
        },
        unacked,
    }
}

/// One backing-queue mutation, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BqCall {
    Purge,
    PurgeAcks,
    Publish(Vec<MessageId>),
    PublishDelivered(Vec<MessageId>),
    SetRamDurationTarget(Option<Duration>),
    DeleteAndTerminate(StopReason),
    Hook,
}

/// Which shape of ack handles the queue returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckShape {
    #[default]
    Flat,
    ByPriority,
}

/// In-memory backing queue recording every mutation it receives.
///
/// Ack tags are `u64`; in [`AckShape::ByPriority`] mode the record's
/// priority is packed into the high bits so tests can check which group a
/// handle came from.
#[derive(Debug, Default)]
pub struct TestBackingQueue {
    content: Vec<MessageRecord>,
    pub published: Vec<Publish>,
    pub published_delivered: Vec<(Message, Props)>,
    pub calls: Vec<BqCall>,
    ack_shape: AckShape,
    next_tag: u64,
}

impl TestBackingQueue {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_content(content: Vec<MessageRecord>) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_shape(mut self, shape: AckShape) -> Self {
        self.ack_shape = shape;
        self
    }

    #[must_use]
    pub fn published_ids(&self) -> Vec<MessageId> {
        self.published.iter().map(|p| p.message.id).collect()
    }

    #[must_use]
    pub fn delivered_ids(&self) -> Vec<MessageId> {
        self.published_delivered.iter().map(|(m, _)| m.id).collect()
    }

    /// Ids in the order this queue republished them, across both paths.
    #[must_use]
    pub fn applied_ids(&self) -> Vec<MessageId> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BqCall::Publish(ids) | BqCall::PublishDelivered(ids) => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl BackingQueue for TestBackingQueue {
    type AckTag = u64;

    fn depth(&self) -> u64 {
        (self.content.len() + self.published.len() + self.published_delivered.len()) as u64
    }

    async fn fold<A, F>(&mut self, mut f: F, acc: A) -> FoldOutcome<A>
    where
        A: Send,
        F: AsyncFnMut(Message, Props, bool, A) -> FoldStep<A> + Send,
    {
        let snapshot = self.content.clone();
        let mut acc = acc;
        for rec in snapshot {
            match f(rec.message, rec.props, rec.unacked, acc).await {
                FoldStep::Cont(next) => acc = next,
                FoldStep::Stop(halt) => return FoldOutcome::Halted(halt),
            }
        }
        FoldOutcome::Done(acc)
    }

    fn purge(&mut self) -> u64 {
        self.calls.push(BqCall::Purge);
        let n = (self.content.len() + self.published.len()) as u64;
        self.content.clear();
        self.published.clear();
        n
    }

    fn purge_acks(&mut self) {
        self.calls.push(BqCall::PurgeAcks);
        self.published_delivered.clear();
    }

    fn batch_publish(&mut self, batch: Vec<Publish>) {
        self.calls
            .push(BqCall::Publish(batch.iter().map(|p| p.message.id).collect()));
        self.published.extend(batch);
    }

    fn batch_publish_delivered(&mut self, batch: Vec<(Message, Props)>) -> AckTags<u64> {
        self.calls.push(BqCall::PublishDelivered(
            batch.iter().map(|(m, _)| m.id).collect(),
        ));
        let tags = match self.ack_shape {
            AckShape::Flat => {
                let mut flat = Vec::new();
                for _ in &batch {
                    flat.push(self.next_tag);
                    self.next_tag += 1;
                }
                AckTags::Flat(flat)
            }
            AckShape::ByPriority => {
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
            }
        };
        self.published_delivered.extend(batch);
        tags
    }

    fn set_ram_duration_target(&mut self, target: Option<Duration>) {
        self.calls.push(BqCall::SetRamDurationTarget(target));
    }

    fn delete_and_terminate(&mut self, reason: StopReason) {
        self.calls.push(BqCall::DeleteAndTerminate(reason));
        self.content.clear();
        self.published.clear();
        self.published_delivered.clear();
    }
}

/// Membership bus delivering broadcasts straight into registered inboxes.
/// A single unbounded channel per target gives the ordered-behind-prior-
/// broadcasts guarantee for free.
#[derive(Clone, Default)]
pub struct TestBus {
    targets: Arc<Mutex<Vec<mpsc::UnboundedSender<SyncStart>>>>,
}

impl TestBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mirror process with the bus.
    ///
    /// # Panics
    /// Panics if the bus lock is poisoned.
    #[must_use]
    pub fn register(&self) -> mpsc::UnboundedReceiver<SyncStart> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.targets.lock().unwrap().push(tx);
        rx
    }
}

impl MembershipBus for TestBus {
    fn broadcast_sync_start(&self, start: SyncStart) {
        for target in self.targets.lock().unwrap().iter() {
            let _ = target.send(start.clone());
        }
    }
}

/// Observer recording every stats callback, cloneable so a concurrent
/// driver can watch progress while the master borrows it.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub infos: Arc<Mutex<Vec<u64>>>,
    pub stats: Arc<Mutex<Vec<u64>>>,
    pub max_ages: Arc<Mutex<Vec<u64>>>,
}

impl SyncObserver for RecordingObserver {
    fn handle_info(&mut self, syncing: u64) {
        self.infos.lock().unwrap().push(syncing);
    }

    fn emit_stats(&mut self, syncing: u64) {
        self.stats.lock().unwrap().push(syncing);
    }

    fn set_maximum_since_use(&mut self, age: u64) {
        self.max_ages.lock().unwrap().push(age);
    }
}

/// The master side of a round: inbox, control-plane send side, observer.
pub struct MasterHarness {
    pub token: RoundToken,
    pub bus: TestBus,
    pub tx: mpsc::UnboundedSender<MasterEvent>,
    rx: mpsc::UnboundedReceiver<MasterEvent>,
    pub shutdown: CancellationToken,
    pub observer: RecordingObserver,
    pub metrics: Arc<SyncMetrics>,
}

impl MasterHarness {
    #[must_use]
    pub fn new(bus: TestBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            token: RoundToken::fresh(),
            bus,
            tx,
            rx,
            shutdown: CancellationToken::new(),
            observer: RecordingObserver::default(),
            metrics: Arc::new(SyncMetrics::new()),
        }
    }

    /// Run one sync round to completion.
    pub async fn run(
        &mut self,
        config: SyncConfig,
        mirrors: Vec<MirrorHandle<TestBackingQueue>>,
        bq: &mut TestBackingQueue,
    ) -> SyncOutcome {
        run_master(
            MasterArgs {
                token: self.token,
                config,
                bus: self.bus.clone(),
                mirrors,
                observer: &mut self.observer,
                inbox: &mut self.rx,
                self_tx: self.tx.clone(),
                shutdown: self.shutdown.clone(),
                metrics: self.metrics.clone(),
            },
            bq,
        )
        .await
    }
}

/// Issue a synchronous cancel and wait for the acknowledgement.
///
/// # Panics
/// Panics if the master is gone or never acknowledges.
pub async fn cancel_sync(tx: &mpsc::UnboundedSender<MasterEvent>) {
    let (reply, ack) = oneshot::channel();
    tx.send(MasterEvent::Cancel { reply }).expect("master gone");
    ack.await.expect("cancel not acknowledged");
}

/// A mirror queue process: reacts to the round-start broadcast by running
/// the real mirror loop against its own backing queue.
pub struct MirrorProcess {
    pub id: MirrorId,
    pub handle: MirrorHandle<TestBackingQueue>,
    /// Inject events into the mirror's sync inbox.
    pub events: mpsc::UnboundedSender<MirrorEvent<TestBackingQueue>>,
    pub shutdown: CancellationToken,
    pub max_ages: Arc<Mutex<Vec<u64>>>,
    task: JoinHandle<(MirrorOutcome<u64, u32>, TestBackingQueue)>,
}

impl MirrorProcess {
    /// Wait for the mirror to finish its round.
    ///
    /// # Panics
    /// Panics if the mirror task itself panicked.
    pub async fn finish(self) -> (MirrorOutcome<u64, u32>, TestBackingQueue) {
        self.task.await.expect("mirror task panicked")
    }
}

/// Spawn a mirror process around the given backing queue. The ram-duration
/// timer starts at zero and each tick increments it.
#[must_use]
pub fn spawn_mirror(
    id: MirrorId,
    bus: &TestBus,
    bq: TestBackingQueue,
    credit: CreditConfig,
) -> MirrorProcess {
    let (tx, mut inbox) = mpsc::unbounded_channel();
    let (guard, mon) = monitor();
    let shutdown = CancellationToken::new();
    let max_ages: Arc<Mutex<Vec<u64>>> = Arc::default();
    let mut starts = bus.register();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        let max_ages = max_ages.clone();
        async move {
            let _guard = guard;
            let mut bq = bq;
            let Some(start) = starts.recv().await else {
                return (MirrorOutcome::Stopped(StopReason::ParentExited), bq);
            };
            let outcome = run_mirror(
                MirrorArgs {
                    token: start.token,
                    id,
                    syncer: start.syncer,
                    credit,
                    timer: 0_u32,
                    refresh_timer: |timer| timer + 1,
                    set_maximum_since_use: move |age| max_ages.lock().unwrap().push(age),
                    inbox: &mut inbox,
                    shutdown,
                },
                &mut bq,
            )
            .await;
            (outcome, bq)
        }
    });
    MirrorProcess {
        id,
        handle: MirrorHandle {
            id,
            tx: tx.clone(),
            monitor: mon,
        },
        events: tx,
        shutdown,
        max_ages,
        task,
    }
}

/// A scripted mirror: opts in on request, then lets the test observe
/// forwarded batches and drive credit by hand. Dropping it simulates a
/// crash.
pub struct ScriptedMirror {
    pub id: MirrorId,
    starts: mpsc::UnboundedReceiver<SyncStart>,
    pub inbox: mpsc::UnboundedReceiver<MirrorEvent<TestBackingQueue>>,
    pub syncer: Option<SyncerHandle>,
    /// Dropped with the mirror; the syncer observes that as a crash.
    _guard: LivenessGuard,
}

impl ScriptedMirror {
    #[must_use]
    pub fn new(id: MirrorId, bus: &TestBus) -> (Self, MirrorHandle<TestBackingQueue>) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (guard, mon) = monitor();
        let starts = bus.register();
        let scripted = Self {
            id,
            starts,
            inbox,
            syncer: None,
            _guard: guard,
        };
        let handle = MirrorHandle {
            id,
            tx,
            monitor: mon,
        };
        (scripted, handle)
    }

    /// Wait for the round announcement without answering it, leaving the
    /// syncer parked in its negotiation phase.
    ///
    /// # Panics
    /// Panics if no announcement arrives.
    pub async fn await_start(&mut self) -> RoundToken {
        let start = self.starts.recv().await.expect("no sync start broadcast");
        let token = start.token;
        self.syncer = Some(start.syncer);
        token
    }

    /// Wait for the round announcement and opt in.
    ///
    /// # Panics
    /// Panics if no announcement arrives.
    pub async fn opt_in(&mut self) -> RoundToken {
        let token = self.await_start().await;
        let syncer = self.syncer.as_ref().expect("just announced");
        let _ = syncer.tx.send(SyncerEvent::SyncReady {
            token,
            mirror: self.id,
        });
        token
    }

    /// Receive the next forwarded batch, skipping other events.
    ///
    /// # Panics
    /// Panics if the syncer goes away first.
    pub async fn next_batch(&mut self) -> Vec<MessageRecord> {
        loop {
            match self.inbox.recv().await.expect("syncer went away") {
                MirrorEvent::SyncMsgs { records, .. } => return records,
                _ => {}
            }
        }
    }

    /// Grant credit back to the syncer.
    ///
    /// # Panics
    /// Panics if called before [`Self::opt_in`].
    pub fn bump(&self, grant: u32) {
        let syncer = self.syncer.as_ref().expect("not opted in");
        let _ = syncer.tx.send(SyncerEvent::BumpCredit {
            mirror: self.id,
            credit: grant,
        });
    }

    /// Crash the mirror: its monitor fires and its inbox closes.
    pub fn die(self) {}
}
