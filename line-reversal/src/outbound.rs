//! Hand-off of encoded datagrams to the listener's sender task.
//!
//! Protocol handlers and [`crate::session::Session::write`] never suspend,
//! so they cannot `send().await` into the bounded outbound queue.
//! [`Outbox::push`] tries the queue first.  Once it is full, that datagram
//! and every later one pushed through the same outbox wait in a backlog,
//! and a spawned task feeds the backlog into the queue in order.
//!
//! ```text
//!  push() ──try_send──▶ outbound queue ──▶ sender task ──▶ UDP
//!    │ full                   ▲
//!    ▼                        │ send().await
//!  backlog ──▶ drain task ────┘
//! ```
//!
//! A datagram is only dropped when the sender task is gone.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::socket::Datagram;

#[derive(Debug, Default)]
struct Backlog {
    queue: VecDeque<Datagram>,
    /// Set while a drain task owns the backlog.
    draining: bool,
}

/// One producer's ordered path into the outbound queue.
#[derive(Debug)]
pub(crate) struct Outbox {
    queue: mpsc::Sender<Datagram>,
    backlog: Arc<Mutex<Backlog>>,
}

impl Outbox {
    pub(crate) fn new(queue: mpsc::Sender<Datagram>) -> Self {
        Self {
            queue,
            backlog: Arc::default(),
        }
    }

    /// Queue `datagram` without waiting.
    pub(crate) fn push(&self, datagram: Datagram) {
        let mut backlog = lock(&self.backlog);
        if backlog.draining {
            backlog.queue.push_back(datagram);
            return;
        }
        match self.queue.try_send(datagram) {
            Ok(()) => {}
            Err(TrySendError::Full(datagram)) => {
                let Ok(runtime) = Handle::try_current() else {
                    warn!(
                        "outbound queue full outside a runtime; dropping datagram to {}",
                        datagram.addr
                    );
                    return;
                };
                debug!("outbound queue full; backlogging datagrams to {}", datagram.addr);
                backlog.queue.push_back(datagram);
                backlog.draining = true;
                runtime.spawn(drain(self.queue.clone(), Arc::clone(&self.backlog)));
            }
            Err(TrySendError::Closed(datagram)) => {
                debug!("outbound queue closed; dropping datagram to {}", datagram.addr);
            }
        }
    }

    /// `true` while earlier datagrams are still waiting for queue space.
    pub(crate) fn is_backlogged(&self) -> bool {
        lock(&self.backlog).draining
    }
}

async fn drain(queue: mpsc::Sender<Datagram>, backlog: Arc<Mutex<Backlog>>) {
    loop {
        let next = {
            let mut backlog = lock(&backlog);
            match backlog.queue.pop_front() {
                Some(datagram) => datagram,
                None => {
                    backlog.draining = false;
                    return;
                }
            }
        };
        if queue.send(next).await.is_err() {
            let mut backlog = lock(&backlog);
            debug!(
                "outbound queue closed; dropping {} backlogged datagram(s)",
                backlog.queue.len()
            );
            backlog.queue.clear();
            backlog.draining = false;
            return;
        }
    }
}

fn lock(backlog: &Mutex<Backlog>) -> MutexGuard<'_, Backlog> {
    backlog.lock().unwrap_or_else(PoisonError::into_inner)
}
