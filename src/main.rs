//! CLI entry point for feedkeeper.
//!
//! Provides subcommands for watching a streaming feed through a redundant
//! connection fleet and for polling a pull-only feed at a bounded rate.

use anyhow::Result;
use clap::{Parser, Subcommand};
use feedkeeper::{
    connection::FeedEvents,
    fetch::{BasicClient, RatedClient, fetch_bytes},
    fleet::{Fleet, FleetConfig, UrlProvider},
    report::FleetReport,
    timed_map::TimedMap,
    transport::{TransportError, tungstenite::WsTransport},
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "feedkeeper")]
#[command(about = "Resilient consumption of live transit-data feeds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a streaming feed over redundant WebSocket connections
    Watch {
        /// WebSocket URL of the feed
        #[arg(value_name = "URL")]
        url: String,

        /// Number of redundant connections to hold open
        #[arg(short, long, default_value_t = 2)]
        connections: usize,

        /// Seconds without receive activity before a connection restarts
        #[arg(long, default_value_t = 30)]
        stall_secs: u64,

        /// Seconds a connection may trail the freshest one before restarting
        #[arg(long, default_value_t = 60)]
        lag_secs: u64,

        /// Seconds of fleet-wide silence before restarting the stalest slot
        #[arg(long, default_value_t = 120)]
        silent_secs: u64,

        /// Minimum milliseconds between socket creations fleet-wide
        #[arg(long, default_value_t = 2000)]
        start_gap_ms: u64,

        /// Seconds each cached update stays live
        #[arg(long, default_value_t = 300)]
        ttl_secs: u64,

        /// Seconds between status reports
        #[arg(short, long, default_value_t = 30)]
        report_secs: u64,
    },
    /// Poll a pull-only feed over HTTP at a bounded rate
    Poll {
        /// HTTP URL of the feed
        #[arg(value_name = "URL")]
        url: String,

        /// Steady request rate in requests per second
        #[arg(short, long, default_value_t = 1.0)]
        rate: f64,

        /// Requests allowed through before the steady rate kicks in
        #[arg(short, long, default_value_t = 5)]
        burst: usize,

        /// Number of polls to perform (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 1)]
        num_polls: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/feedkeeper.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("feedkeeper.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            url,
            connections,
            stall_secs,
            lag_secs,
            silent_secs,
            start_gap_ms,
            ttl_secs,
            report_secs,
        } => {
            let config = FleetConfig {
                concurrent_connections: connections,
                url: UrlProvider::Fixed(url),
                stall_threshold: Duration::from_secs(stall_secs),
                lag_threshold: Duration::from_secs(lag_secs),
                all_connections_silent_threshold: Duration::from_secs(silent_secs),
                start_delay_between_connections: Duration::from_millis(start_gap_ms),
            };
            watch(config, Duration::from_secs(ttl_secs), report_secs).await?;
        }
        Commands::Poll {
            url,
            rate,
            burst,
            num_polls,
        } => {
            poll(&url, rate, burst, num_polls).await?;
        }
    }

    Ok(())
}

/// Caches each received update under a monotonically increasing key so the
/// TTL map bounds memory while showing how much data is live. Real consumers
/// would key by entity id and drop updates older than the cached one.
struct CachingEvents {
    cache: TimedMap<u64, String>,
    seq: AtomicU64,
}

impl FeedEvents for CachingEvents {
    fn on_open(&self, slot: usize) {
        info!(slot, "connection open");
    }

    fn on_message(&self, slot: usize, raw: &str) {
        let key = self.seq.fetch_add(1, Ordering::Relaxed);
        self.cache.set(key, raw.to_string());
        debug!(slot, bytes = raw.len(), "update cached");
    }

    fn on_close(&self, slot: usize, code: u16, reason: &str) -> Option<Duration> {
        warn!(slot, code, reason, "connection closed");
        None
    }

    fn on_error(&self, slot: usize, error: &TransportError) -> Option<Duration> {
        error!(slot, error = %error, "connection error");
        None
    }
}

/// Holds a connection fleet open against the feed, caching updates and
/// emitting a JSON status report at a fixed interval until Ctrl+C.
#[tracing::instrument(skip(config), fields(connections = config.concurrent_connections))]
async fn watch(config: FleetConfig, ttl: Duration, report_secs: u64) -> Result<()> {
    let cache = TimedMap::new(ttl);
    let events = Arc::new(CachingEvents {
        cache: cache.clone(),
        seq: AtomicU64::new(0),
    });

    let fleet = Fleet::new(config, Arc::new(WsTransport), events)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(report_secs.max(1)));
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = FleetReport::capture(&fleet, cache.len());
                println!("{}", report.to_json()?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                fleet.terminate();
                break;
            }
        }
    }

    Ok(())
}

/// Polls the feed repeatedly; the rate limiter lets the first `burst`
/// requests through immediately and paces the rest.
#[tracing::instrument(skip(rate, burst))]
async fn poll(url: &str, rate: f64, burst: usize, num_polls: usize) -> Result<()> {
    let client = RatedClient::new(BasicClient::new()?, burst, rate);

    if num_polls == 0 {
        info!(rate, "Polling infinitely. Press Ctrl+C to stop.");
    } else {
        info!(num_polls, rate, "Starting polls");
    }

    let mut count = 0;
    loop {
        if num_polls > 0 && count >= num_polls {
            break;
        }
        count += 1;

        match fetch_bytes(&client, url).await {
            Ok(bytes) => info!(poll = count, bytes = bytes.len(), "Feed fetched"),
            Err(e) => error!(poll = count, error = %e, "Feed fetch failed"),
        }
    }

    info!(count, "Finished polling");
    Ok(())
}
