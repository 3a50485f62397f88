//! `line-reversal`: LRCP, a reliable byte stream over UDP, and the line
//! reversal service that runs on it.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  read / write / close  ┌──────────────────────────┐
//!  │  reverse     │───────────────────────▶│  Session                 │
//!  │ (application)│                        │  Receiver │ Sender │ timer│
//!  └──────────────┘                        └─────▲───────────┬────────┘
//!                                                │ on_data   │ datagrams
//!                                                │ on_ack    ▼
//!  ┌─────────────────────────────────────────────┴───────────────────┐
//!  │  Listener: session table, reader task, sender task               │
//!  └──────────────────────────────┬──────────────────────────────────┘
//!                                 │ /connect/ /data/ /ack/ /close/
//!                          ┌──────▼──────┐
//!                          │   Socket    │  (thin async wrapper around tokio UdpSocket)
//!                          └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`message`]  : wire format (parse / serialise)
//! - [`receiver`] : cumulative-offset receive state machine
//! - [`sender`]   : chunking and unacked-segment tracking
//! - [`state`]    : session lifecycle states
//! - [`timer`]    : retransmission and expiry
//! - [`session`]  : per-session locking, handlers and the stream API
//! - [`listener`] : socket ownership and session demultiplexing
//! - `outbound`   : ordered, lossless hand-off to the sender task
//! - [`socket`]   : async UDP socket abstraction
//! - [`reverse`]  : the line reversal application

pub mod listener;
pub mod message;
mod outbound;
pub mod receiver;
pub mod reverse;
pub mod sender;
pub mod session;
pub mod socket;
pub mod state;
pub mod timer;

pub use listener::{Listener, ListenerConfig, ListenerError};
pub use message::{Message, ParseError};
pub use session::{Session, SessionError};
pub use state::SessionState;
pub use timer::TimerConfig;
