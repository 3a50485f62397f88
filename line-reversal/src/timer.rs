//! Retransmission timer.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent until
//! the peer confirms them.  LRCP uses the simplest possible scheme: every
//! session owns one periodic task that, on each tick,
//! - closes the session when data is outstanding and the peer has not acked
//!   anything for longer than [`TimerConfig::session_expiry`], or otherwise
//! - resends the wire bytes of every unacked segment.
//!
//! There is no RTT estimation and no back-off; the interval is fixed.  The
//! task is spawned by [`crate::session::Session::on_connect`] and exits as
//! soon as the session's lifecycle state becomes
//! [`SessionState::Closed`](crate::state::SessionState::Closed).

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::session::Session;

/// How often unacked segments are resent.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(3);

/// How long a peer may leave data unacknowledged before the session is dropped.
pub const DEFAULT_SESSION_EXPIRY: Duration = Duration::from_secs(60);

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Period of the retransmission tick.
    pub retransmit_interval: Duration,
    /// Silence after which a session with outstanding data is closed.
    pub session_expiry: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            session_expiry: DEFAULT_SESSION_EXPIRY,
        }
    }
}

/// Drive retransmission for `session` until it closes.
pub(crate) async fn retransmit_loop(session: Arc<Session>, config: TimerConfig) {
    let mut state = session.subscribe();
    let period = config.retransmit_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("session {}: retransmit timer started", session.id());
    loop {
        if state.borrow_and_update().is_closed() {
            break;
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !session.on_retransmit_tick(Instant::now()) {
                    break;
                }
            }
        }
    }
    debug!("session {}: retransmit timer stopped", session.id());
}
