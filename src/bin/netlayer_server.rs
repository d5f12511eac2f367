//! netlayer echo server
//!
//! Satu network thread memanggil `get_jobs`, worker pool menjalankan job.
//! Setiap BinaryMessage dikirim balik ke pengirimnya.
//!
//! Usage:
//!   cargo run --release --bin netlayer_server -- [OPTIONS]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info};

use netlayer::network::Connection;
use netlayer::{
    logging, BufferPolicy, Dispatcher, Framing, JobHandler, ServerConfig, ServerNetworkLayer,
};

#[derive(Parser)]
#[command(name = "netlayer_server")]
#[command(about = "Echo server on top of the netlayer TCP network layer", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker threads; 0 runs every job on the network thread
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    #[arg(long, value_enum)]
    buffers: Option<BufferArg>,

    #[arg(long, value_enum)]
    framing: Option<FramingArg>,

    /// Stop after this many seconds (0 = run forever)
    #[arg(long, default_value_t = 0)]
    run_for: u64,

    /// Seconds between stats lines
    #[arg(long, default_value_t = 5)]
    stats_every: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum BufferArg {
    Reuse,
    PerCall,
}

#[derive(Clone, Copy, ValueEnum)]
enum FramingArg {
    Raw,
    Chunked,
}

/// Server statistics
#[derive(Default)]
struct EchoStats {
    messages: AtomicU64,
    bytes: AtomicU64,
    closes: AtomicU64,
    send_errors: AtomicU64,
}

impl EchoStats {
    fn log(&self, uptime: Duration, connections: usize) {
        let msgs = self.messages.load(Ordering::Relaxed);
        info!(
            uptime_s = uptime.as_secs(),
            connections,
            messages = msgs,
            rate = format!("{:.1}/s", msgs as f64 / uptime.as_secs_f64().max(1e-3)),
            kb = self.bytes.load(Ordering::Relaxed) / 1024,
            closes = self.closes.load(Ordering::Relaxed),
            send_errors = self.send_errors.load(Ordering::Relaxed),
            "stats"
        );
    }
}

struct Echo {
    stats: Arc<EchoStats>,
}

impl JobHandler for Echo {
    fn on_message(&self, connection: &Arc<Connection>, message: Vec<u8>) {
        connection.mark_open();
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(message.len() as u64, Ordering::Relaxed);

        if let Err(e) = connection.write(message) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            debug!(conn = connection.id(), error = %e, "echo failed, closing");
            connection.close();
        }
    }

    fn on_close(&self, connection: &Arc<Connection>) {
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
        connection.close();
    }
}

fn build_config(args: &Args) -> Result<ServerConfig, netlayer::ConfigError> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(b) = args.buffers {
        config.buffer_policy = match b {
            BufferArg::Reuse => BufferPolicy::Reuse,
            BufferArg::PerCall => BufferPolicy::PerCall,
        };
    }
    if let Some(f) = args.framing {
        config.framing = match f {
            FramingArg::Raw => Framing::Raw,
            FramingArg::Chunked => Framing::Chunked,
        };
    }
    // Worker konkuren tidak boleh berbagi satu buffer
    if args.workers > 1 && config.buffer_policy == BufferPolicy::Reuse {
        info!("multiple workers: switching to per-call buffers");
        config.buffer_policy = BufferPolicy::PerCall;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args, config: ServerConfig) -> netlayer::Result<()> {
    let poll_timeout = config.poll_timeout();

    let mut layer = ServerNetworkLayer::new(config)?;
    layer.start()?;

    let stats = Arc::new(EchoStats::default());
    let mut dispatcher = Dispatcher::new(
        Echo {
            stats: Arc::clone(&stats),
        },
        args.workers,
    );

    let started = Instant::now();
    let run_for = (args.run_for > 0).then(|| Duration::from_secs(args.run_for));
    let stats_every = Duration::from_secs(args.stats_every.max(1));
    let mut last_stats = Instant::now();

    loop {
        let jobs = layer.get_jobs(poll_timeout);
        // Juga melepas delayed call yang tertahan, walau cycle ini kosong
        dispatcher.dispatch(jobs);

        if last_stats.elapsed() >= stats_every {
            stats.log(started.elapsed(), layer.connection_count());
            last_stats = Instant::now();
        }
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }

    let jobs = layer.stop();
    dispatcher.dispatch(jobs);
    dispatcher.shutdown();
    layer.teardown();

    stats.log(started.elapsed(), 0);
    Ok(())
}

fn main() -> ExitCode {
    logging::init("info,netlayer=info");
    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
