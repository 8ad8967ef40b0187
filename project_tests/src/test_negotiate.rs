//! # Live Timing Negotiate Probe
//!
//! Runs the negotiate handshake against the real hub and prints the session it
//! got back, then streams for a few seconds and prints what ended up in the
//! consolidated state. Outside of a live session the handshake is expected to fail.

use std::time::Duration;

use clap::Parser;
use lib_common::core::state_store;
use lib_common::ingestors::negotiate::DEFAULT_UPSTREAM_URL;
use lib_common::ingestors::{LiveTimingConfig, LiveTimingIngestor, Negotiator, NegotiatorConfig};

#[derive(Parser, Debug)]
#[clap(about = "Probe the live timing hub")]
struct Args {
    /// Base URL of the hub.
    #[clap(long, default_value = DEFAULT_UPSTREAM_URL)]
    url: String,

    /// Seconds to stream after a successful handshake (0 skips streaming).
    #[clap(long, default_value_t = 10)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let args = Args::parse();

    let negotiator_config = NegotiatorConfig {
        base_url: args.url.clone(),
        ..NegotiatorConfig::default()
    };
    let negotiator = Negotiator::new(negotiator_config.clone())?;

    println!("[*] Negotiating with {} ...", args.url);
    let session = match negotiator.negotiate().await {
        Ok(session) => session,
        Err(e) => {
            // // Statement: Failure - no live session, or the hub is unreachable
            eprintln!("\n[ERROR] Negotiation failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    };

    println!("\n[SUCCESS] Session negotiated:");
    println!("-----------------------------------------------");
    println!("Token:      {}", session.connection_token);
    println!("Cookie:     {}", session.cookie);
    println!("Stream URL: {}", session.stream_url);
    println!("-----------------------------------------------");

    if args.seconds == 0 {
        return Ok(());
    }

    // // Statement: Stream through the real ingestor and inspect the merged state
    let (writer, reader) = state_store();
    let config = LiveTimingConfig {
        negotiator: negotiator_config,
        ..LiveTimingConfig::default()
    };
    let ingestor = LiveTimingIngestor::new(config, writer)?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(ingestor.run(shutdown_rx));

    println!("[*] Streaming for {} seconds ...", args.seconds);
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    let _ = shutdown_tx.send(());
    handle.await?;

    let snapshot = reader.current();
    println!("\n[INFO] Link: {:?}, updates: {}, topics: {}", snapshot.link, snapshot.updates, snapshot.tree.len());
    for (topic, value) in snapshot.tree.iter() {
        let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
        println!("  - {:<22} {} bytes", topic, size);
    }
    assert!(snapshot.updates > 0, "no updates received during a live session");

    Ok(())
}
