//! One LRCP session: a reliable byte stream bound to a single peer.
//!
//! # Architecture
//!
//! ```text
//!  Application            Listener reader task         Retransmit timer
//!   read() / write()        on_data() / on_ack()         on_retransmit_tick()
//!      │      │                │          │                      │
//!      │      └──────┐   ┌─────┘          └───────┐   ┌──────────┘
//!      ▼             ▼   ▼                        ▼   ▼
//!  ┌──────────────────────────┐            ┌──────────────────────┐
//!  │ Mutex<Receiver> + Notify │            │    Mutex<Sender>     │
//!  └──────────────────────────┘            └──────────┬───────────┘
//!                                                     │ encoded datagrams
//!                                          Outbox ──▶ outbound queue
//! ```
//!
//! The receive side and the send side are locked independently, so a reader
//! parked in [`Session::read`] never holds up acks or retransmissions.  The
//! lifecycle lives in a `watch` channel so the timer task observes the move
//! to [`SessionState::Closed`] and stops.
//!
//! None of the protocol handlers suspend.  Datagrams go through the
//! session's [`Outbox`], which backlogs them in order while the outbound
//! queue is full instead of dropping them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::listener::SessionTable;
use crate::message::Message;
use crate::outbound::Outbox;
use crate::receiver::{Delivery, Receiver};
use crate::sender::{AckOutcome, Sender};
use crate::socket::Datagram;
use crate::state::SessionState;
use crate::timer::{self, TimerConfig};

/// Errors surfaced to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session ended: closed locally, closed by the peer, expired, or
    /// terminated after a protocol violation or transport failure.
    #[error("connection closed")]
    Closed,
    /// The stream has reached the largest offset the wire format can carry.
    #[error("stream offset limit reached")]
    OffsetExhausted,
}

/// A reliable, ordered byte stream multiplexed over the listener's socket.
///
/// Sessions are handed out as `Arc<Session>` by
/// [`crate::listener::Listener::accept`]; every method takes `&self`, so one
/// task may read while another writes.
#[derive(Debug)]
pub struct Session {
    id: u32,
    peer: SocketAddr,
    local: SocketAddr,
    timers: TimerConfig,

    receiver: Mutex<Receiver>,
    readable: Notify,

    sender: Mutex<Sender>,

    state: watch::Sender<SessionState>,
    outbound: Outbox,
    table: Weak<SessionTable>,
}

impl Session {
    pub(crate) fn new(
        id: u32,
        peer: SocketAddr,
        local: SocketAddr,
        timers: TimerConfig,
        outbound: mpsc::Sender<Datagram>,
        table: Weak<SessionTable>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Pending);
        Arc::new(Self {
            id,
            peer,
            local,
            timers,
            receiver: Mutex::new(Receiver::new()),
            readable: Notify::new(),
            sender: Mutex::new(Sender::new(id, Instant::now())),
            state,
            outbound: Outbox::new(outbound),
            table,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Address of the remote endpoint; fixed for the session's lifetime.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Address of the listener's socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    // -----------------------------------------------------------------------
    // Application API
    // -----------------------------------------------------------------------

    /// Read received bytes into `buf`.
    ///
    /// Waits until at least one byte is available, then copies as many as
    /// fit and returns immediately; a short read is normal.  Bytes that
    /// arrived before the session closed are still returned; after that,
    /// [`SessionError::Closed`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Registered before checking so a wakeup between the check and
            // the await is not lost.
            let notified = self.readable.notified();
            {
                let mut receiver = lock(&self.receiver);
                if receiver.buffered() > 0 {
                    return Ok(receiver.read(buf));
                }
            }
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            notified.await;
        }
    }

    /// Queue `data` for reliable delivery.
    ///
    /// Never waits: the bytes are cut into segments and handed to the
    /// outbound queue at once.  Returns the full length of `data`.
    pub fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut sender = lock(&self.sender);
        if !sender.can_accept(data.len()) {
            return Err(SessionError::OffsetExhausted);
        }
        sender.arm_expiry(Instant::now());
        for wire in sender.push(data) {
            self.enqueue(wire);
        }
        debug!(
            "session {}: wrote {} bytes, next_pos={} in_flight={}",
            self.id,
            data.len(),
            sender.next_pos(),
            sender.in_flight()
        );
        Ok(data.len())
    }

    /// Close the session and tell the peer.
    ///
    /// Wakes any blocked reader with [`SessionError::Closed`], stops the
    /// retransmission timer, and removes the session from its listener.
    /// Closing an already closed session does nothing.
    pub fn close(&self) {
        if self.terminate() {
            self.send(Message::Close { session: self.id });
        }
    }

    // -----------------------------------------------------------------------
    // Protocol handlers (listener reader task and timer)
    // -----------------------------------------------------------------------

    /// Handle a `connect` for this session.
    ///
    /// The first call acks length 0, establishes the session and starts its
    /// retransmission timer.  A repeated `connect` acks length 0 again, even
    /// when data has already been received.
    pub(crate) fn on_connect(self: &Arc<Self>) {
        let mut opened = false;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Pending {
                *state = SessionState::Established;
                opened = true;
                return true;
            }
            false
        });
        if self.is_closed() {
            return;
        }

        self.send(Message::Ack {
            session: self.id,
            length: 0,
        });

        if opened {
            info!("session {}: established with {}", self.id, self.peer);
            tokio::spawn(timer::retransmit_loop(Arc::clone(self), self.timers));
        } else {
            debug!("session {}: duplicate connect, re-acking 0", self.id);
        }
    }

    /// Handle a Data segment starting at stream offset `pos`.
    pub(crate) fn on_data(&self, pos: u32, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        let (delivery, total) = {
            let mut receiver = lock(&self.receiver);
            let delivery = receiver.on_segment(pos, data);
            (delivery, receiver.total_received())
        };

        match delivery {
            Delivery::Accepted(n) => {
                debug!("session {}: accepted {n} bytes at {pos}, total={total}", self.id);
                self.readable.notify_waiters();
            }
            Delivery::Duplicate => {
                debug!("session {}: duplicate data at {pos}, total={total}", self.id);
            }
            Delivery::Gap => {
                debug!("session {}: gap at {pos}, expected {total}", self.id);
            }
        }

        self.send(Message::Ack {
            session: self.id,
            length: total,
        });
    }

    /// Handle a cumulative ack from the peer.
    pub(crate) fn on_ack(&self, length: u32) {
        if self.is_closed() {
            return;
        }
        let outcome = lock(&self.sender).on_ack(length, Instant::now());
        match outcome {
            AckOutcome::Acked(n) => {
                debug!("session {}: ack {length} released {n} segment(s)", self.id);
            }
            AckOutcome::Violation => {
                warn!(
                    "session {}: peer acked {length} bytes that were never sent; closing",
                    self.id
                );
                self.send(Message::Close { session: self.id });
                self.terminate();
            }
        }
    }

    /// One retransmission tick.  Returns `false` once the session is over.
    pub(crate) fn on_retransmit_tick(&self, now: Instant) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let sender = lock(&self.sender);
            if !sender.is_expired(now, self.timers.session_expiry) {
                if self.outbound.is_backlogged() {
                    debug!("session {}: previous round still queued; skipping retransmit", self.id);
                    return true;
                }
                for segment in sender.unacked() {
                    debug!("session {}: retransmit data at {}", self.id, segment.pos);
                    self.enqueue(segment.wire.clone());
                }
                return true;
            }
        }
        info!("session {}: no ack from {} in time; expiring", self.id, self.peer);
        self.terminate();
        false
    }

    /// Move to [`SessionState::Closed`] without notifying the peer.
    ///
    /// Returns `true` if this call performed the transition.
    pub(crate) fn terminate(&self) -> bool {
        let closed_now = self.state.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = SessionState::Closed;
            true
        });
        if !closed_now {
            return false;
        }

        if let Some(table) = self.table.upgrade() {
            table.remove(self.id, self);
        }
        self.readable.notify_waiters();
        info!("session {}: closed", self.id);
        true
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    fn send(&self, message: Message) {
        self.enqueue(message.encode());
    }

    fn enqueue(&self, bytes: Vec<u8>) {
        self.outbound.push(Datagram {
            bytes,
            addr: self.peer,
        });
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MAX_NUMERIC;
    use crate::sender::MAX_CHUNK;
    use std::time::Duration;

    const PEER: &str = "127.0.0.1:9000";
    const LOCAL: &str = "127.0.0.1:8000";

    fn timers() -> TimerConfig {
        TimerConfig {
            retransmit_interval: Duration::from_secs(3),
            session_expiry: Duration::from_secs(60),
        }
    }

    fn session(id: u32) -> (Arc<Session>, mpsc::Receiver<Datagram>) {
        let (tx, rx) = mpsc::channel(256);
        let session = Session::new(
            id,
            PEER.parse().unwrap(),
            LOCAL.parse().unwrap(),
            timers(),
            tx,
            Weak::new(),
        );
        (session, rx)
    }

    /// Pop every queued datagram as a string.
    fn sent(rx: &mut mpsc::Receiver<Datagram>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            assert_eq!(d.addr, PEER.parse::<SocketAddr>().unwrap());
            out.push(String::from_utf8(d.bytes).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn connect_acks_zero_and_establishes() {
        let (s, mut rx) = session(1);
        assert_eq!(s.state(), SessionState::Pending);
        s.on_connect();
        assert_eq!(s.state(), SessionState::Established);
        assert_eq!(sent(&mut rx), vec!["/ack/1/0/"]);
        s.close();
    }

    #[tokio::test]
    async fn duplicate_connect_reacks_zero_after_data() {
        let (s, mut rx) = session(1);
        s.on_connect();
        s.on_data(0, b"hello");
        s.on_connect();
        assert_eq!(sent(&mut rx), vec!["/ack/1/0/", "/ack/1/5/", "/ack/1/0/"]);
        s.close();
    }

    #[tokio::test]
    async fn data_is_delivered_and_acked() {
        let (s, mut rx) = session(1);
        s.on_connect();
        sent(&mut rx);

        s.on_data(0, b"hello");
        assert_eq!(sent(&mut rx), vec!["/ack/1/5/"]);

        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        s.close();
    }

    #[tokio::test]
    async fn duplicate_data_is_delivered_once() {
        let (s, mut rx) = session(1);
        s.on_connect();
        sent(&mut rx);

        s.on_data(0, b"hello");
        s.on_data(0, b"hello");
        assert_eq!(sent(&mut rx), vec!["/ack/1/5/", "/ack/1/5/"]);

        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(lock(&s.receiver).buffered(), 0);
        s.close();
    }

    #[tokio::test]
    async fn gap_is_reacked_with_unchanged_total() {
        let (s, mut rx) = session(1);
        s.on_connect();
        s.on_data(0, b"abc");
        sent(&mut rx);

        s.on_data(10, b"later");
        assert_eq!(sent(&mut rx), vec!["/ack/1/3/"]);
        assert_eq!(lock(&s.receiver).buffered(), 3);
        s.close();
    }

    #[tokio::test]
    async fn read_waits_for_data() {
        let (s, _rx) = session(1);
        s.on_connect();

        let reader = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let n = s.read(&mut buf).await?;
                Ok::<_, SessionError>(buf[..n].to_vec())
            })
        };
        tokio::task::yield_now().await;
        s.on_data(0, b"late");

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader woke")
            .unwrap();
        assert_eq!(got, Ok(b"late".to_vec()));
        s.close();
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader() {
        let (s, mut rx) = session(1);
        s.on_connect();

        let reader = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                s.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        s.close();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader woke")
            .unwrap();
        assert_eq!(got, Err(SessionError::Closed));
        assert_eq!(sent(&mut rx), vec!["/ack/1/0/", "/close/1/"]);

        // Closing twice sends nothing more.
        s.close();
        assert!(sent(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn buffered_bytes_survive_close() {
        let (s, _rx) = session(1);
        s.on_connect();
        s.on_data(0, b"tail");
        s.terminate();

        let mut buf = [0u8; 8];
        assert_eq!(s.read(&mut buf).await, Ok(4));
        assert_eq!(s.read(&mut buf).await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn write_emits_data_and_ack_releases_it() {
        let (s, mut rx) = session(1);
        s.on_connect();
        sent(&mut rx);

        assert_eq!(s.write(b"olleh\n"), Ok(6));
        assert_eq!(sent(&mut rx), vec!["/data/1/0/olleh\n/"]);
        assert_eq!(lock(&s.sender).in_flight(), 1);

        s.on_ack(6);
        assert_eq!(lock(&s.sender).in_flight(), 0);
        assert!(sent(&mut rx).is_empty());
        s.close();
    }

    #[tokio::test]
    async fn over_ack_closes_session() {
        let (s, mut rx) = session(7);
        s.on_connect();
        s.write(b"abc").unwrap();
        sent(&mut rx);

        s.on_ack(4);
        assert!(s.is_closed());
        assert_eq!(sent(&mut rx), vec!["/close/7/"]);
        assert_eq!(s.write(b"more"), Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn full_queue_delays_but_never_drops() {
        let (tx, mut rx) = mpsc::channel(4);
        let s = Session::new(
            2,
            PEER.parse().unwrap(),
            LOCAL.parse().unwrap(),
            timers(),
            tx,
            Weak::new(),
        );
        s.on_connect();
        s.write(&vec![b'x'; 20 * MAX_CHUNK]).unwrap();
        s.on_ack(MAX_NUMERIC);
        assert!(s.is_closed());

        let mut wires = Vec::new();
        loop {
            let d = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("outbound queue stalled")
                .unwrap();
            let wire = String::from_utf8(d.bytes).unwrap();
            let done = wire == "/close/2/";
            wires.push(wire);
            if done {
                break;
            }
        }

        assert_eq!(wires.len(), 22);
        assert_eq!(wires[0], "/ack/2/0/");
        let positions: Vec<usize> = wires[1..21]
            .iter()
            .map(|w| w.split('/').nth(3).unwrap().parse().unwrap())
            .collect();
        assert_eq!(positions, (0..20).map(|i| i * MAX_CHUNK).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn closed_session_ignores_traffic() {
        let (s, mut rx) = session(1);
        s.on_connect();
        s.terminate();
        sent(&mut rx);

        s.on_data(0, b"x");
        s.on_ack(0);
        s.on_connect();
        assert!(sent(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_data_is_retransmitted() {
        let (s, mut rx) = session(1);
        s.on_connect();
        s.write(b"hello").unwrap();
        assert_eq!(sent(&mut rx), vec!["/ack/1/0/", "/data/1/0/hello/"]);

        let resent = rx.recv().await.unwrap();
        assert_eq!(resent.bytes, b"/data/1/0/hello/");

        // Once acked, later ticks resend nothing.
        s.on_ack(5);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sent(&mut rx).is_empty());
        assert!(!s.is_closed());
        s.close();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_expires_session() {
        let (s, mut rx) = session(1);
        s.on_connect();
        s.write(b"hello").unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!s.is_closed());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(s.is_closed());

        let wires = sent(&mut rx);
        assert!(wires.iter().filter(|w| *w == "/data/1/0/hello/").count() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_counts_from_first_outstanding_write() {
        let (s, mut rx) = session(1);
        s.on_connect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        s.write(b"late").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!s.is_closed());
        assert!(sent(&mut rx).iter().any(|w| w == "/data/1/0/late/"));
        s.close();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_does_not_expire() {
        let (s, _rx) = session(1);
        s.on_connect();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!s.is_closed());
        s.close();
    }
}
