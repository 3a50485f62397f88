//! Send-side state machine.
//!
//! [`Sender`] turns application writes into Data segments and tracks every
//! segment the peer has not yet acknowledged.
//!
//! # Protocol contract
//!
//! - Written bytes are sliced immediately into chunks of at most
//!   [`MAX_CHUNK`] bytes, each stamped with the next stream offset.  There is
//!   no window: every chunk is sent as soon as it exists.
//! - ACKs are **cumulative**: `length = K` means the peer holds every byte
//!   below offset `K`.  Segments are released from the front of the unacked
//!   queue once their end offset is covered.
//! - An ACK for bytes never sent (`length > next_pos`) is a protocol
//!   violation and reported as [`AckOutcome::Violation`].
//! - On each retransmission tick the caller resends the stored wire bytes of
//!   **all** unacked segments unchanged.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.
//!
//! ```text
//!  acked            next_pos
//!    │                  │
//!  ──┼──────────────────┼──────────────▶ stream offset
//!    │ <── unacked ───▶ │
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{needs_escape, Message, MAX_MESSAGE_LEN, MAX_NUMERIC};

/// Largest payload placed in a single Data segment.
pub const MAX_CHUNK: usize = 900;

/// A sent segment awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Stream offset of the first payload byte.
    pub pos: u32,
    /// Number of payload bytes (before escaping).
    pub len: usize,
    /// The encoded Data message, resent verbatim on retransmission.
    pub wire: Vec<u8>,
}

impl Segment {
    /// First offset after this segment's payload.
    pub fn end(&self) -> u64 {
        u64::from(self.pos) + self.len as u64
    }
}

/// Result of processing one inbound ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `n` segments were released from the unacked queue (possibly zero for
    /// a duplicate or stale ACK).
    Acked(usize),
    /// The peer acknowledged bytes that were never sent.
    Violation,
}

/// Send-side state for one session.
#[derive(Debug)]
pub struct Sender {
    session: u32,

    /// Offset assigned to the next new segment (total bytes ever written).
    next_pos: u32,

    /// Sent segments ordered by offset (front = oldest).
    unacked: VecDeque<Segment>,

    /// When the peer last acknowledged anything.
    last_ack: Instant,
}

impl Sender {
    /// Create a new [`Sender`] for `session`; `now` seeds the expiry clock.
    pub fn new(session: u32, now: Instant) -> Self {
        Self {
            session,
            next_pos: 0,
            unacked: VecDeque::new(),
            last_ack: now,
        }
    }

    pub fn next_pos(&self) -> u32 {
        self.next_pos
    }

    /// Number of segments currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }

    /// `true` while `n` more bytes still fit below [`MAX_NUMERIC`].
    pub fn can_accept(&self, n: usize) -> bool {
        let end = u64::from(self.next_pos) + n as u64;
        end <= u64::from(MAX_NUMERIC)
    }

    /// Cut `data` into segments at the next stream offsets.
    ///
    /// Returns the wire bytes of each new segment, in offset order, ready
    /// for immediate transmission.  Every returned segment is also recorded
    /// as unacked.  Check [`Sender::can_accept`] first.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        debug_assert!(self.can_accept(data.len()), "stream offset exhausted");
        let mut out = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.next_chunk_len(rest);
            let (chunk, tail) = rest.split_at(n);
            rest = tail;
            let pos = self.next_pos;
            let wire = Message::Data {
                session: self.session,
                pos,
                data: chunk.to_vec(),
            }
            .encode();

            self.next_pos += n as u32;
            out.push(wire.clone());
            self.unacked.push_back(Segment { pos, len: n, wire });
        }
        out
    }

    /// Length of the next chunk cut from the front of `rest`: at most
    /// [`MAX_CHUNK`] bytes, and never so many that the escaped message would
    /// reach [`MAX_MESSAGE_LEN`].
    fn next_chunk_len(&self, rest: &[u8]) -> usize {
        let header = format!("/data/{}/{}/", self.session, self.next_pos).len();
        // Leaves room for the closing '/' and keeps the total strictly below the limit.
        let budget = MAX_MESSAGE_LEN - 2 - header;

        let mut wire = 0;
        let mut n = 0;
        for &b in rest.iter().take(MAX_CHUNK) {
            let cost = if needs_escape(b) { 2 } else { 1 };
            if wire + cost > budget {
                break;
            }
            wire += cost;
            n += 1;
        }
        n
    }

    /// Restart the expiry clock at `now` when nothing is outstanding, so a
    /// long idle stretch is not held against the peer once data is written.
    pub fn arm_expiry(&mut self, now: Instant) {
        if !self.has_unacked() {
            self.last_ack = now;
        }
    }

    /// Process a cumulative ACK received at `now`.
    pub fn on_ack(&mut self, length: u32, now: Instant) -> AckOutcome {
        self.last_ack = now;
        if length > self.next_pos {
            return AckOutcome::Violation;
        }

        let mut acked = 0;
        while let Some(front) = self.unacked.front() {
            if front.end() <= u64::from(length) {
                self.unacked.pop_front();
                acked += 1;
            } else {
                break;
            }
        }
        AckOutcome::Acked(acked)
    }

    /// Every unacked segment from oldest to newest.
    pub fn unacked(&self) -> impl Iterator<Item = &Segment> {
        self.unacked.iter()
    }

    /// `true` when data is outstanding and the peer has been silent for
    /// longer than `expiry`.
    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        self.has_unacked() && now.saturating_duration_since(self.last_ack) > expiry
    }
}
