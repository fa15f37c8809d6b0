//! Fake SITL simulator process for end-to-end harness tests.
//!
//! Behaves like the real simulator from the harness's point of view: prints
//! the readiness marker to its output after a configurable delay, then serves
//! the ground-control protocol on a UDP port. Flags exercise the failure
//! paths — `--mute` never signals readiness, `--ignore-term` rides out the
//! graceful phase so the harness has to escalate to a forced kill.

use std::time::Duration;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mavrig_core::config::READY_MARKER;
use mavrig_core::stub::StubAutopilot;

#[derive(Parser)]
#[command(name = "sitl-stub")]
#[command(about = "Protocol-speaking fake autopilot for harness tests")]
struct Args {
    /// UDP port to listen on
    #[arg(long)]
    port: u16,

    /// Delay before printing the readiness marker, in milliseconds
    #[arg(long, default_value_t = 200)]
    ready_after_ms: u64,

    /// Print the readiness marker to stderr instead of stdout
    #[arg(long)]
    marker_to_stderr: bool,

    /// Never print the readiness marker
    #[arg(long)]
    mute: bool,

    /// Keep running through SIGTERM (exercises the forced-kill path)
    #[arg(long)]
    ignore_term: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    #[cfg(unix)]
    if args.ignore_term {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                sigterm.recv().await;
                info!("ignoring SIGTERM");
            }
        });
    }

    let socket = UdpSocket::bind(("127.0.0.1", args.port)).await?;
    info!(port = args.port, "stub autopilot listening");

    tokio::time::sleep(Duration::from_millis(args.ready_after_ms)).await;
    if !args.mute {
        if args.marker_to_stderr {
            eprintln!("{READY_MARKER}");
        } else {
            println!("{READY_MARKER}");
        }
    }

    StubAutopilot::new()
        .serve(socket, CancellationToken::new())
        .await?;
    Ok(())
}
