//! Opaque correlators for rounds and messages.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Correlation token tagging every message of one sync round.
///
/// Fresh per round and never reused. Receivers drop any event carrying a
/// token from a different round.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundToken(u128);

impl RoundToken {
    /// Generate a token for a new round.
    #[must_use]
    pub fn fresh() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for RoundToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // low bits are enough to correlate log lines
        write!(f, "round:{:08x}", self.0 as u32)
    }
}

/// Immutable identifier of a queue message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u128);

impl MessageId {
    #[must_use]
    pub fn fresh() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg:{:08x}", self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tokens_are_distinct() {
        let a = RoundToken::fresh();
        let b = RoundToken::fresh();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }
}
