//! Session lifecycle state.
//!
//! LRCP has no handshake beyond the opening `connect`/`ack 0` exchange and no
//! half-close, so the lifecycle of a [`crate::session::Session`] is a short
//! linear chain.  Transitions are driven only by [`crate::session`]:
//!
//! ```text
//!  PENDING ──on_connect──▶ ESTABLISHED ──close / expiry / violation──▶ CLOSED
//!     │                                                                  ▲
//!     └──────────────────────────── close ───────────────────────────────┘
//! ```

use std::fmt;

/// All possible states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Registered by the listener; the opening ack has not been sent yet.
    #[default]
    Pending,
    /// Opening ack sent and retransmission timer running.
    Established,
    /// Terminal.  Reads drain what is buffered, then fail; writes fail.
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Established => "established",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
