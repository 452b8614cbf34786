//! Error types and the operator message ring.
//!
//! Every operator-visible condition becomes a bounded text message on
//! a most-recent-N ring; overflow drops the oldest entry and counts
//! the drop. Internal errors are typed per crate; this module holds
//! the ones shared across the workspace.

use heapless::{Deque, String};
use thiserror::Error;

/// Longest operator message text kept on the ring.
pub const OPERATOR_MSG_LEN: usize = 120;

/// How many operator messages the ring retains.
pub const OPERATOR_RING_DEPTH: usize = 16;

/// Errors shared across the workspace boundary.
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("config error: {0}")]
    Config(std::string::String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid joint index {0}")]
    BadJoint(usize),
    #[error("value out of range: {0}")]
    OutOfRange(std::string::String),
}

/// Classification of an operator message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatorMsgKind {
    /// Something went wrong; motion may have been aborted.
    Error = 0,
    /// Informational display text.
    Display = 1,
    /// A program-requested operator message (M-code message).
    Text = 2,
}

/// One entry on the operator ring.
#[derive(Debug, Clone)]
pub struct OperatorMsg {
    pub serial: u32,
    pub kind: OperatorMsgKind,
    pub text: String<OPERATOR_MSG_LEN>,
}

/// Bounded most-recent-N operator message ring.
///
/// Single-writer; readers drain via `pop`. Overflow evicts the oldest
/// message and increments `dropped` so the operator display can show
/// that history was lost.
#[derive(Debug)]
pub struct OperatorMsgRing {
    ring: Deque<OperatorMsg, OPERATOR_RING_DEPTH>,
    next_serial: u32,
    dropped: u32,
}

impl Default for OperatorMsgRing {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorMsgRing {
    pub const fn new() -> Self {
        Self {
            ring: Deque::new(),
            next_serial: 1,
            dropped: 0,
        }
    }

    /// Post a message; text beyond the bound is truncated.
    pub fn post(&mut self, kind: OperatorMsgKind, text: &str) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);

        let mut bounded = String::new();
        for ch in text.chars() {
            if bounded.push(ch).is_err() {
                break;
            }
        }

        let msg = OperatorMsg {
            serial,
            kind,
            text: bounded,
        };
        if self.ring.is_full() {
            let _ = self.ring.pop_front();
            self.dropped += 1;
        }
        // Cannot fail: a slot was just freed if full.
        let _ = self.ring.push_back(msg);
        serial
    }

    /// Shorthand for an error-kind post.
    pub fn error(&mut self, text: &str) -> u32 {
        tracing::warn!(target: "operator", "{text}");
        self.post(OperatorMsgKind::Error, text)
    }

    /// Oldest unread message, removed from the ring.
    pub fn pop(&mut self) -> Option<OperatorMsg> {
        self.ring.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Messages evicted before being read.
    #[inline]
    pub const fn dropped(&self) -> u32 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_pop_in_order() {
        let mut ring = OperatorMsgRing::new();
        let s1 = ring.post(OperatorMsgKind::Error, "first");
        let s2 = ring.post(OperatorMsgKind::Display, "second");
        assert!(s2 > s1);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop().unwrap().text.as_str(), "first");
        assert_eq!(ring.pop().unwrap().text.as_str(), "second");
        assert!(ring.pop().is_none());
    }

    #[test]
    fn overflow_keeps_most_recent() {
        let mut ring = OperatorMsgRing::new();
        for i in 0..(OPERATOR_RING_DEPTH + 3) {
            ring.post(OperatorMsgKind::Error, &format!("msg {i}"));
        }
        assert_eq!(ring.dropped(), 3);
        assert_eq!(ring.len(), OPERATOR_RING_DEPTH);
        // The oldest surviving message is the fourth posted.
        assert_eq!(ring.pop().unwrap().text.as_str(), "msg 3");
    }

    #[test]
    fn long_text_is_truncated_not_rejected() {
        let mut ring = OperatorMsgRing::new();
        let long = "y".repeat(OPERATOR_MSG_LEN * 2);
        ring.post(OperatorMsgKind::Text, &long);
        let msg = ring.pop().unwrap();
        assert_eq!(msg.text.len(), OPERATOR_MSG_LEN);
    }
}
