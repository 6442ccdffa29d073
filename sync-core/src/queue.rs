//! Backing queue capability interface.

use core::fmt;
use std::time::Duration;

use crate::error::{StopReason, SyncHalt};
use crate::record::{Message, Priority, Props, Publish};

/// Hook run against a backing queue from the outside.
pub type BqHook<B> = Box<dyn FnOnce(&mut B) + Send>;

/// Continuation decision returned by a fold callback.
#[derive(Debug)]
pub enum FoldStep<A> {
    Cont(A),
    Stop(SyncHalt),
}

/// Result of folding over a queue snapshot.
#[derive(Debug)]
pub enum FoldOutcome<A> {
    /// The snapshot was exhausted.
    Done(A),
    /// The callback stopped the fold early.
    Halted(SyncHalt),
}

/// Ack handles returned by [`BackingQueue::batch_publish_delivered`].
///
/// Flat queues return one handle per record in publish order; priority
/// queues return handles grouped per priority. The shape is decided by the
/// backing queue on every batch and the caller must handle both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckTags<T> {
    Flat(Vec<T>),
    ByPriority(Vec<(Priority, Vec<T>)>),
}

/// The pluggable storage engine behind a master or a mirror.
///
/// Each role owns its backing queue exclusively; no operation here is
/// shared between tasks.
#[expect(async_fn_in_trait)]
pub trait BackingQueue: Send + 'static {
    /// Opaque token for a pending unacknowledged message.
    type AckTag: fmt::Debug + Send;

    /// Number of messages currently held, ack-tracked ones included.
    fn depth(&self) -> u64;

    /// Fold over the queue snapshot in queue order.
    ///
    /// The callback may suspend between items (the master parks on syncer
    /// acknowledgements inside it) and may stop the fold early; the
    /// outcome carries the halt reason unchanged.
    async fn fold<A, F>(&mut self, f: F, acc: A) -> FoldOutcome<A>
    where
        A: Send,
        F: AsyncFnMut(Message, Props, bool, A) -> FoldStep<A> + Send;

    /// Drop all regular content. Returns the number of messages removed.
    fn purge(&mut self) -> u64;

    /// Drop all ack-tracked content.
    fn purge_acks(&mut self);

    /// Publish a batch of regular messages. Confirms and flow control are
    /// not engaged on this path; the master has already dealt with both.
    fn batch_publish(&mut self, batch: Vec<Publish>);

    /// Publish a batch straight into the delivered-but-unacknowledged
    /// state, returning the ack handles.
    fn batch_publish_delivered(&mut self, batch: Vec<(Message, Props)>) -> AckTags<Self::AckTag>;

    /// Run an externally supplied hook against this queue.
    fn invoke(&mut self, hook: BqHook<Self>)
    where
        Self: Sized,
    {
        hook(self);
    }

    fn set_ram_duration_target(&mut self, target: Option<Duration>);

    /// Tear the queue down. Used when the master is deleted out of band.
    fn delete_and_terminate(&mut self, reason: StopReason);
}
