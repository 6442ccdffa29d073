//! Credit-based flow control between sync peers.
//!
//! One token bucket per peer: the sending side charges one credit per
//! forwarded batch and reports itself blocked once any peer's budget is
//! exhausted; the receiving side acks absorbed batches and owes a credit
//! grant back on a fixed cadence. This bounds the memory a slow receiver
//! can inflict on its sender.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Credit parameters.
///
/// `initial` is the sender's per-peer budget; `more_credit_after` is the
/// receiver's ack cadence and the size of each grant.
#[derive(Debug, Clone, Copy)]
pub struct CreditConfig {
    pub initial: u32,
    pub more_credit_after: u32,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            initial: 400,
            more_credit_after: 200,
        }
    }
}

/// Per-peer credit bookkeeping, usable from either side of a flow.
#[derive(Debug)]
pub struct CreditFlow<P> {
    config: CreditConfig,
    /// Remaining sends allowed towards each peer.
    outgoing: HashMap<P, i64>,
    /// Absorbed batches remaining until the next grant is owed to a peer.
    incoming: HashMap<P, u32>,
    blocked: HashSet<P>,
}

impl<P: Copy + Eq + Hash> CreditFlow<P> {
    #[must_use]
    pub fn new(config: CreditConfig) -> Self {
        Self {
            config,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            blocked: HashSet::new(),
        }
    }

    /// Charge one credit for a send to `peer`.
    pub fn send(&mut self, peer: P) {
        let credit = self
            .outgoing
            .entry(peer)
            .or_insert_with(|| i64::from(self.config.initial));
        *credit -= 1;
        if *credit <= 0 {
            self.blocked.insert(peer);
        }
    }

    /// Whether any peer has exhausted its credit. No sends may happen
    /// while this is true.
    #[must_use]
    pub fn blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    /// Apply a credit grant received from `peer`.
    pub fn handle_bump(&mut self, peer: P, credit: u32) {
        let balance = self
            .outgoing
            .entry(peer)
            .or_insert_with(|| i64::from(self.config.initial));
        *balance += i64::from(credit);
        if *balance > 0 {
            self.blocked.remove(&peer);
        }
    }

    /// Record one absorbed batch from `peer`. Returns the grant owed back
    /// when the ack cadence fires.
    pub fn ack(&mut self, peer: P) -> Option<u32> {
        let remaining = self
            .incoming
            .entry(peer)
            .or_insert(self.config.more_credit_after);
        *remaining -= 1;
        if *remaining == 0 {
            *remaining = self.config.more_credit_after;
            Some(self.config.more_credit_after)
        } else {
            None
        }
    }

    /// Forget all state for a peer that went down. Unblocks the flow if
    /// that peer was the one holding it up.
    pub fn peer_down(&mut self, peer: P) {
        self.outgoing.remove(&peer);
        self.incoming.remove(&peer);
        self.blocked.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(initial: u32, more_credit_after: u32) -> CreditFlow<u32> {
        CreditFlow::new(CreditConfig {
            initial,
            more_credit_after,
        })
    }

    #[test]
    fn blocks_after_initial_credit_is_spent() {
        let mut f = flow(2, 1);
        f.send(1);
        assert!(!f.blocked());
        f.send(1);
        assert!(f.blocked());
    }

    #[test]
    fn bump_unblocks() {
        let mut f = flow(1, 1);
        f.send(1);
        assert!(f.blocked());

        f.handle_bump(1, 1);
        assert!(!f.blocked());
    }

    #[test]
    fn one_exhausted_peer_blocks_the_whole_flow() {
        let mut f = flow(1, 1);
        f.send(1);
        f.send(2);
        assert!(f.blocked());

        f.handle_bump(1, 5);
        // peer 2 is still out of credit
        assert!(f.blocked());
        f.handle_bump(2, 5);
        assert!(!f.blocked());
    }

    #[test]
    fn ack_grants_on_cadence() {
        let mut f = flow(10, 3);
        assert_eq!(f.ack(1), None);
        assert_eq!(f.ack(1), None);
        assert_eq!(f.ack(1), Some(3));
        // cadence restarts
        assert_eq!(f.ack(1), None);
    }

    #[test]
    fn peer_down_releases_the_block() {
        let mut f = flow(1, 1);
        f.send(1);
        assert!(f.blocked());

        f.peer_down(1);
        assert!(!f.blocked());
        // a reappearing peer starts from a fresh budget
        f.send(1);
        assert!(f.blocked());
    }
}
