//! Session multiplexer: one UDP socket, many LRCP sessions.
//!
//! # Architecture
//!
//! ```text
//!            ┌───────────── Listener ─────────────┐
//!  UDP ────▶ │ reader task ──▶ SessionTable (id → Arc<Session>)
//!            │     │                  │            │
//!            │     │ new sessions     │ handlers   │
//!            │     ▼                  ▼            │
//!            │  accept queue    outbound queue ──▶ sender task ──▶ UDP
//!            └────────────────────────────────────┘
//! ```
//!
//! The reader task decodes each datagram and routes it by session id.
//! Malformed datagrams are dropped without reply.  Data and Ack for unknown
//! sessions, and every Close, are answered with Close.  All socket writes go
//! through the single sender task.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::Message;
use crate::outbound::Outbox;
use crate::session::Session;
use crate::socket::{Datagram, Socket, SocketError};
use crate::timer::TimerConfig;

/// Default capacity of the outbound datagram queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 32;

/// Established sessions that may wait for [`Listener::accept`].
pub const ACCEPT_BACKLOG: usize = 128;

/// Listener tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    pub timers: TimerConfig,
    /// Capacity of the queue feeding the sender task.
    pub outbound_queue: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            timers: TimerConfig::default(),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

/// Errors returned by [`Listener`].
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The socket failed; the listener and all its sessions are closed.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The listener is no longer accepting sessions.
    #[error("listener closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

/// Live sessions keyed by id.
///
/// Only the reader task inserts.  Entries are removed by the reader task on
/// Close and by sessions themselves on teardown.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
}

impl SessionTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<u32, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.entries().get(&id).cloned()
    }

    fn insert(&self, session: Arc<Session>) {
        self.entries().insert(session.id(), session);
    }

    fn take(&self, id: u32) -> Option<Arc<Session>> {
        self.entries().remove(&id)
    }

    fn drain(&self) -> Vec<Arc<Session>> {
        self.entries().drain().map(|(_, s)| s).collect()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }

    /// Remove `id` only while it still maps to `session`; a later session may
    /// have reused the id.
    pub(crate) fn remove(&self, id: u32, session: &Session) {
        let mut entries = self.entries();
        if entries
            .get(&id)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session))
        {
            entries.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepts LRCP sessions on a UDP socket.
///
/// Dropping the listener stops its tasks and closes every live session.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    sessions: Arc<SessionTable>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<io::Result<Arc<Session>>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Listener {
    /// Bind a UDP socket to `addr` and start the reader and sender tasks.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ListenerConfig,
    ) -> Result<Self, ListenerError> {
        let socket = Arc::new(Socket::bind(addr).await?);
        let local_addr = socket.local_addr;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let sessions = Arc::new(SessionTable::default());

        let writer = tokio::spawn(send_loop(Arc::clone(&socket), outbound_rx));
        let demux = Demux {
            socket,
            sessions: Arc::clone(&sessions),
            replies: Outbox::new(outbound_tx.clone()),
            outbound: outbound_tx,
            accepted: accept_tx,
            timers: config.timers,
        };
        let reader = tokio::spawn(demux.run());

        info!("listening on {local_addr}");
        Ok(Self {
            local_addr,
            sessions,
            accepted: tokio::sync::Mutex::new(accept_rx),
            reader,
            writer,
        })
    }

    /// Wait for the next session to complete its opening handshake.
    pub async fn accept(&self) -> Result<Arc<Session>, ListenerError> {
        let mut accepted = self.accepted.lock().await;
        match accepted.recv().await {
            Some(Ok(session)) => Ok(session),
            Some(Err(e)) => Err(ListenerError::Io(e)),
            None => Err(ListenerError::Closed),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        for session in self.sessions.drain() {
            session.terminate();
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// State owned by the reader task.
struct Demux {
    socket: Arc<Socket>,
    sessions: Arc<SessionTable>,
    outbound: mpsc::Sender<Datagram>,
    /// Close replies for sessions the table does not hold.
    replies: Outbox,
    accepted: mpsc::Sender<io::Result<Arc<Session>>>,
    timers: TimerConfig,
}

impl Demux {
    async fn run(self) {
        loop {
            match self.socket.recv_from().await {
                Ok((message, from)) => self.dispatch(message, from).await,
                Err(SocketError::Parse { from, source }) => {
                    debug!("dropping datagram from {from}: {source}");
                }
                Err(SocketError::Io(e)) => {
                    error!("socket read failed: {e}");
                    for session in self.sessions.drain() {
                        session.terminate();
                    }
                    let _ = self.accepted.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, message: Message, from: SocketAddr) {
        debug!("{from} -> {}/{}", message.kind(), message.session());
        match message {
            Message::Connect { session } => {
                if let Some(existing) = self.sessions.get(session) {
                    existing.on_connect();
                    return;
                }
                let created = Session::new(
                    session,
                    from,
                    self.socket.local_addr,
                    self.timers,
                    self.outbound.clone(),
                    Arc::downgrade(&self.sessions),
                );
                self.sessions.insert(Arc::clone(&created));
                created.on_connect();
                if self.accepted.send(Ok(created)).await.is_err() {
                    debug!("session {session}: nobody is accepting");
                }
            }
            Message::Data { session, pos, data } => match self.sessions.get(session) {
                Some(s) => s.on_data(pos, &data),
                None => self.reply_close(session, from),
            },
            Message::Ack { session, length } => match self.sessions.get(session) {
                Some(s) => s.on_ack(length),
                None => self.reply_close(session, from),
            },
            Message::Close { session } => {
                self.reply_close(session, from);
                if let Some(s) = self.sessions.take(session) {
                    info!("session {session}: closed by peer");
                    s.terminate();
                }
            }
        }
    }

    fn reply_close(&self, session: u32, addr: SocketAddr) {
        self.replies.push(Datagram {
            bytes: Message::Close { session }.encode(),
            addr,
        });
    }
}

async fn send_loop(socket: Arc<Socket>, mut outbound: mpsc::Receiver<Datagram>) {
    while let Some(datagram) = outbound.recv().await {
        if let Err(e) = socket.send_to(&datagram.bytes, datagram.addr).await {
            warn!("send to {} failed: {e}", datagram.addr);
        }
    }
}
