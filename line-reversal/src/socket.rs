//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that receives
//! [`crate::message::Message`]s instead of raw bytes.  Outbound traffic is
//! sent as pre-encoded bytes because retransmissions replay the exact wire
//! form of a segment.  All protocol logic lives elsewhere; this module owns
//! only byte I/O.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::message::{Message, ParseError, MAX_MESSAGE_LEN};

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The received datagram could not be decoded as a valid message.
    #[error("malformed datagram from {from}: {source}")]
    Parse {
        from: SocketAddr,
        #[source]
        source: ParseError,
    },
}

/// One encoded datagram queued for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub addr: SocketAddr,
}

/// An async, message-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared between the reader
/// and sender tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send already-encoded bytes as a single UDP datagram to `dest`.
    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Message`].
    ///
    /// Returns `(message, sender_address)`.  Datagrams longer than the
    /// protocol allows are truncated by the read and then rejected by the
    /// parser.  Parse failures come back as [`SocketError::Parse`]; the
    /// caller decides whether to keep reading.
    pub async fn recv_from(&self) -> Result<(Message, SocketAddr), SocketError> {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let (n, from) = self.inner.recv_from(&mut buf).await?;
        let message =
            Message::decode(&buf[..n]).map_err(|source| SocketError::Parse { from, source })?;
        Ok((message, from))
    }
}
