//! Flow cookie layout and the restart-round protocol.
//!
//! Every installed flow carries a 32-bit cookie split `[4-bit round |
//! 28-bit sequence]`. The round distinguishes flows from the current agent
//! lifetime from those of a previous one; replay retires the previous
//! round after a settle delay.

use std::sync::atomic::{AtomicU32, Ordering};

pub const FLOW_ROUND_NUM_LENGTH: u32 = 4;
pub const FLOW_SEQ_NUM_LENGTH: u32 = 28;
pub const FLOW_ROUND_NUM_MASK: u64 = 0xf000_0000;
pub const FLOW_SEQ_NUM_MASK: u64 = 0x0fff_ffff;

/// Largest round value; the successor of 15 is 1, never 0.
pub const MAX_ROUND_NUM: u8 = 15;

/// Key under which the current round persists in the local bridge's
/// `external_ids` map.
pub const RESTART_ROUND_KEY: &str = "datapathRestartRound";

/// Extract the round nibble from a flow cookie.
pub fn round_of(cookie: u64) -> u8 {
    ((cookie & FLOW_ROUND_NUM_MASK) >> FLOW_SEQ_NUM_LENGTH) as u8
}

/// Extract the sequence part from a flow cookie.
pub fn sequence_of(cookie: u64) -> u32 {
    (cookie & FLOW_SEQ_NUM_MASK) as u32
}

/// Build a cookie from a round and sequence number.
pub fn cookie(round: u8, seq: u32) -> u64 {
    (u64::from(round) << FLOW_SEQ_NUM_LENGTH) | (u64::from(seq) & FLOW_SEQ_NUM_MASK)
}

/// The persisted generation counter: the round read from switch metadata
/// and the round this lifetime installs flows under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub previous: Option<u8>,
    pub current: u8,
}

impl RoundInfo {
    /// First round of a switch with no (or unreadable) persisted state.
    pub fn initial() -> Self {
        Self {
            previous: None,
            current: 1,
        }
    }

    /// Compute the round that follows a persisted value.
    /// Wraps `MAX_ROUND_NUM` to 1 and never yields 0.
    pub fn next(previous: u8) -> Self {
        let current = if previous >= MAX_ROUND_NUM {
            1
        } else {
            previous + 1
        };
        Self {
            previous: Some(previous),
            current,
        }
    }
}

/// Per-bridge cookie allocator. The round occupies the high nibble of the
/// 32-bit cookie; the sequence restarts from 1 whenever the round changes.
#[derive(Debug)]
pub struct CookieAllocator {
    round: AtomicU32,
    next_seq: AtomicU32,
}

impl CookieAllocator {
    pub fn new(round: u8) -> Self {
        Self {
            round: AtomicU32::new(u32::from(round)),
            next_seq: AtomicU32::new(1),
        }
    }

    pub fn round(&self) -> u8 {
        self.round.load(Ordering::Relaxed) as u8
    }

    /// Switch to a new round. Sequence numbering restarts.
    pub fn set_round(&self, round: u8) {
        self.round.store(u32::from(round), Ordering::Relaxed);
        self.next_seq.store(1, Ordering::Relaxed);
    }

    /// Allocate the next cookie under the current round.
    pub fn allocate(&self) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        cookie(self.round(), seq)
    }
}
