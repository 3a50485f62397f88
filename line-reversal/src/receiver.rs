//! Receive-side state machine.
//!
//! [`Receiver`] reconciles inbound Data segments against the cumulative
//! offset of bytes already delivered:
//!
//! - Data entirely below `total_received` is a retransmission and changes
//!   nothing.
//! - Data straddling `total_received` contributes only its unseen suffix.
//! - Data starting beyond `total_received` leaves a gap and is **discarded**;
//!   nothing is buffered out of order.
//!
//! Whatever the outcome, the caller acks [`Receiver::total_received`].
//!
//! This module only manages state; locking, waking readers and sending acks
//! are the responsibility of [`crate::session`].

use std::collections::VecDeque;

/// What happened to one inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// `n` new bytes were appended to the application buffer.
    Accepted(usize),
    /// Every byte had already been delivered.
    Duplicate,
    /// The segment starts past the next expected offset.
    Gap,
}

/// Receive-side state for one session.
#[derive(Debug, Default)]
pub struct Receiver {
    /// Bytes delivered so far; both the next expected offset and the value
    /// to acknowledge.
    total_received: u32,

    /// In-order bytes not yet consumed by the application.
    buffer: VecDeque<u8>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative count of bytes delivered, as placed in outbound acks.
    pub fn total_received(&self) -> u32 {
        self.total_received
    }

    /// Number of buffered bytes waiting for the application.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Process one Data segment starting at stream offset `pos`.
    pub fn on_segment(&mut self, pos: u32, data: &[u8]) -> Delivery {
        let start = u64::from(pos);
        let end = start + data.len() as u64;
        let total = u64::from(self.total_received);

        if start > total {
            return Delivery::Gap;
        }
        if end <= total {
            return Delivery::Duplicate;
        }
        // Past this point the stream offset could no longer be acknowledged.
        let Ok(new_total) = u32::try_from(end) else {
            return Delivery::Gap;
        };
        if new_total > crate::message::MAX_NUMERIC {
            return Delivery::Gap;
        }

        let fresh = &data[(total - start) as usize..];
        self.buffer.extend(fresh.iter().copied());
        self.total_received = new_total;
        Delivery::Accepted(fresh.len())
    }

    /// Copy up to `buf.len()` buffered bytes into `buf`.  Returns the number
    /// of bytes actually copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.buffer.len());
        for (dst, src) in buf[..n].iter_mut().zip(self.buffer.drain(..n)) {
            *dst = src;
        }
        n
    }
}
