//! Message records as seen by the sync path.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::token::MessageId;

/// Message priority. Higher values are delivered first by priority queues.
pub type Priority = u8;

/// Ordered ack handles collected by a mirror, one per ack-tracked message
/// it republished. On promotion this lets the new master honor outstanding
/// acks.
pub type AckMap<T> = Vec<(MessageId, T)>;

/// An immutable message: identifier, priority, payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub priority: Priority,
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(priority: Priority, payload: Bytes) -> Self {
        Self {
            id: MessageId::fresh(),
            priority,
            payload,
        }
    }
}

/// Delivery metadata attached to a message on the sync path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Props {
    /// Whether a publisher confirm is still owed for this message.
    pub needs_confirming: bool,
    pub size: u64,
}

/// One queue entry handed from the master to the syncer.
///
/// `unacked` is true when the master held this message in the
/// delivered-but-not-yet-acknowledged state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: Message,
    pub props: Props,
    pub unacked: bool,
}

/// A record rewritten for republication on a mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub message: Message,
    pub props: Props,
    pub delivered: bool,
}

/// Group an ack-tracked run by message priority, preserving publish order
/// within each group. Used to zip per-priority ack handles back onto the
/// records that produced them.
#[must_use]
pub fn partition_publish_delivered_batch(
    batch: &[(Message, Props)],
) -> BTreeMap<Priority, Vec<(Message, Props)>> {
    let mut groups: BTreeMap<Priority, Vec<(Message, Props)>> = BTreeMap::new();
    for (message, props) in batch {
        groups
            .entry(message.priority)
            .or_default()
            .push((message.clone(), *props));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: Priority) -> (Message, Props) {
        (
            Message::new(priority, Bytes::from_static(b"x")),
            Props::default(),
        )
    }

    #[test]
    fn partition_groups_by_priority_preserving_order() {
        let batch = vec![entry(7), entry(0), entry(7), entry(3)];
        let groups = partition_publish_delivered_batch(&batch);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&0].len(), 1);
        assert_eq!(groups[&3].len(), 1);
        let high: Vec<_> = groups[&7].iter().map(|(m, _)| m.id).collect();
        assert_eq!(high, vec![batch[0].0.id, batch[2].0.id]);
    }

    #[test]
    fn partition_of_empty_batch_is_empty() {
        assert!(partition_publish_delivered_batch(&[]).is_empty());
    }
}
