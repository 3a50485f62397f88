//! Entry point for `line-reversal`.
//!
//! Parses CLI arguments, binds the LRCP listener and serves every accepted
//! session with the line reversal application.  All protocol work is
//! delegated to library modules; `main.rs` owns only process setup (logging,
//! argument parsing) and the accept loop.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use line_reversal::{reverse, Listener, ListenerConfig, ListenerError, TimerConfig};

/// Line reversal over LRCP (a reliable byte stream on UDP).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Interval between retransmissions of unacknowledged data, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    retransmit_ms: u64,

    /// Seconds without an ack before a session with outstanding data is dropped.
    #[arg(long, default_value_t = 60)]
    expiry_secs: u64,

    /// Capacity of the outbound datagram queue.
    #[arg(long, default_value_t = line_reversal::listener::DEFAULT_OUTBOUND_QUEUE)]
    outbound_queue: usize,
}

impl Cli {
    fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            timers: TimerConfig {
                retransmit_interval: Duration::from_millis(self.retransmit_ms),
                session_expiry: Duration::from_secs(self.expiry_secs),
            },
            outbound_queue: self.outbound_queue,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let address = format!("{}:{}", cli.host, cli.port);

    let listener = Listener::bind(address.as_str(), cli.listener_config())
        .await
        .with_context(|| format!("failed to listen on {address}"))?;
    log::info!("server listening on {}", listener.local_addr());

    loop {
        match listener.accept().await {
            Ok(session) => {
                tokio::spawn(reverse::serve(session));
            }
            Err(ListenerError::Closed) => {
                log::info!("listener closed");
                return Ok(());
            }
            Err(e) => return Err(e).context("listener failed"),
        }
    }
}
