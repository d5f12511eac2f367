//! netlayer client
//!
//! Connect ke `opc.tcp://host:port`, kirim N message, tunggu echo-nya.
//!
//! Usage:
//!   cargo run --release --bin netlayer_client -- opc.tcp://127.0.0.1:4840 -n 1000

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};

use netlayer::{connect, logging, ConnectionConfig, TransportError};

#[derive(Parser)]
#[command(name = "netlayer_client")]
#[command(about = "Sends messages to a netlayer echo server", long_about = None)]
struct Args {
    /// Endpoint, e.g. opc.tcp://127.0.0.1:4840
    url: String,

    /// Messages to send
    #[arg(short = 'n', long, default_value_t = 100)]
    count: u32,

    /// Payload bytes per message
    #[arg(short, long, default_value_t = 64)]
    size: usize,

    /// Receive timeout per echo, milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

fn run(args: &Args) -> netlayer::Result<()> {
    let conn = connect(ConnectionConfig::default(), &args.url)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let size = args.size.min(conn.local_config().send_buffer_size as usize);

    let start = Instant::now();
    let mut latencies = Vec::with_capacity(args.count as usize);
    let mut lost = 0u32;

    for seq in 0..args.count {
        let mut buf = conn.acquire_buffer()?;
        buf.truncate(size);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (seq as usize + i) as u8;
        }

        let sent_at = Instant::now();
        conn.write(buf)?;

        // Echo bisa datang terpotong; kumpulkan sampai lengkap
        let mut got = 0;
        while got < size {
            match conn.receive(timeout) {
                Ok(bytes) => got += bytes.len(),
                Err(TransportError::CommunicationTimeout) => {
                    warn!(seq, got, "echo timed out");
                    lost += 1;
                    break;
                }
                Err(e) => {
                    conn.close();
                    return Err(e);
                }
            }
        }
        if got >= size {
            latencies.push(sent_at.elapsed());
        }
    }
    conn.close();

    let elapsed = start.elapsed();
    latencies.sort();
    let pct = |p: usize| {
        latencies
            .get(latencies.len().saturating_sub(1) * p / 100)
            .copied()
            .unwrap_or_default()
    };
    info!(
        sent = args.count,
        echoed = latencies.len(),
        lost,
        elapsed_ms = elapsed.as_millis() as u64,
        p50_us = pct(50).as_micros() as u64,
        p99_us = pct(99).as_micros() as u64,
        "done"
    );
    Ok(())
}

fn main() -> ExitCode {
    logging::init("info");
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(url = %args.url, error = %e, "client failed");
            ExitCode::FAILURE
        }
    }
}
