//! The line reversal application.
//!
//! Reads newline-terminated lines from a session and sends each one back
//! with its characters in reverse order.  It sees only the byte-stream
//! surface of [`Session`]: `read`, `write`, `close` and the addresses.

use std::sync::Arc;

use log::{debug, info};

use crate::session::{Session, SessionError};

const READ_CHUNK: usize = 1024;

/// Reverse the characters of `line`.
///
/// Valid UTF-8 is reversed by Unicode scalar value so multi-byte characters
/// stay intact; anything else is reversed byte by byte.
pub fn reverse_line(line: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(line) {
        Ok(text) => text.chars().rev().collect::<String>().into_bytes(),
        Err(_) => line.iter().rev().copied().collect(),
    }
}

/// Serve one session until it closes.
///
/// Partial lines are held until their newline arrives.  The session is
/// closed on return.
pub async fn serve(session: Arc<Session>) {
    info!(
        "client connected: session {} from {}",
        session.id(),
        session.peer_addr()
    );

    match reverse_lines(&session).await {
        Err(SessionError::Closed) => {}
        Err(e) => info!("session {}: {e}", session.id()),
        Ok(()) => {}
    }
    session.close();

    info!("client disconnected: session {}", session.id());
}

async fn reverse_lines(session: &Session) -> Result<(), SessionError> {
    let mut pending = Vec::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = session.read(&mut buf).await?;
        pending.extend_from_slice(&buf[..n]);

        while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=newline).collect();
            let mut reply = reverse_line(&line[..newline]);
            reply.push(b'\n');
            debug!(
                "session {}: {:?} -> {:?}",
                session.id(),
                String::from_utf8_lossy(&line[..newline]),
                String::from_utf8_lossy(&reply[..newline])
            );
            session.write(&reply)?;
        }
    }
}
