//! # Pulze Receiver
//!
//! Listens for Pulze telemetry, reports packet loss for the current sender,
//! and answers with keep-alive heartbeats when the sender asks for them.
//! Device setting requests (Wi-Fi sleep policy, lock type) are logged; this
//! binary has no platform hooks to apply them.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:51423, multicast group 224.0.0.251
//! pulze-receiver
//!
//! # Unicast/broadcast only, JSON lines on stdout
//! pulze-receiver --no-multicast --json
//!
//! # From a config file, overriding the bind address
//! pulze-receiver --config pulze.toml --bind 0.0.0.0:6000
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing_subscriber::EnvFilter;

use pulze_core::config::PulzeConfig;
use pulze_core::events::{ChannelSink, ReceiverEvent, StatsSnapshot};
use pulze_core::receiver::ReceiverLoop;

/// Pulze telemetry receiver.
#[derive(Parser, Debug)]
#[command(name = "pulze-receiver", about = "Pulze link-quality receiver")]
struct Cli {
    /// TOML config file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to receive telemetry on.
    #[arg(long, short = 'b')]
    bind: Option<SocketAddr>,

    /// Multicast group to join.
    #[arg(long, conflicts_with = "no_multicast")]
    multicast_group: Option<Ipv4Addr>,

    /// Do not join any multicast group.
    #[arg(long, default_value_t = false)]
    no_multicast: bool,

    /// Port on the sender that keep-alive heartbeats go to.
    #[arg(long)]
    keep_alive_port: Option<u16>,

    /// Print every event as a JSON line on stdout (logs go to stderr).
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let config = load_config(&cli)?;
    tracing::info!(
        bind = %config.receiver.bind,
        multicast = ?config.receiver.multicast_group,
        keep_alive_port = config.keep_alive.peer_port,
        "pulze-receiver starting"
    );

    // ── Receiver ────────────────────────────────────────────────
    let (sink, events) = ChannelSink::new(1024);
    let sink = Arc::new(sink);
    let mut receiver = ReceiverLoop::bind(&config, sink.clone(), sink)
        .context("failed to start telemetry receiver")?
        .spawn()?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    // ── Event loop ──────────────────────────────────────────────
    let mut last: Option<StatsSnapshot> = None;
    let mut bogus: u64 = 0;
    let mut last_summary = Instant::now();
    let summary_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) && receiver.is_running() {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if cli.json {
                    println!("{}", serde_json::to_string(&event)?);
                }
                match event {
                    ReceiverEvent::StatsUpdated(s) => last = Some(s),
                    ReceiverEvent::BogusPacket => bogus += 1,
                    ReceiverEvent::KeepAliveChanged { interval } => {
                        tracing::info!(interval_ms = ?interval.map(|d| d.as_millis()), "keep-alive changed");
                    }
                    ReceiverEvent::ApplySleepPolicy { code } => {
                        tracing::info!(code, "sleep policy requested (no platform hook)");
                    }
                    ReceiverEvent::ApplyLockType { code } => {
                        tracing::info!(code, "lock type requested (no platform hook)");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_summary.elapsed() >= summary_interval {
            if let Some(s) = &last {
                tracing::info!(
                    last_seq = s.last_sequence,
                    packets = s.packet_count,
                    lost = s.lost_count,
                    loss_percent = s.loss_percent,
                    keep_alive_ms = ?s.keep_alive_interval.map(|d| d.as_millis()),
                    sleep_policy = s.sleep_policy,
                    lock_type = s.lock_type,
                    bogus,
                    "link stats"
                );
            } else {
                tracing::info!(bogus, "waiting for telemetry");
            }
            last_summary = Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    // State-change events wait for channel room; with the consumer gone
    // they are discarded instead, so the loop can wind down.
    drop(events);
    receiver.stop().context("receiver failed")?;
    tracing::info!("pulze-receiver stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<PulzeConfig> {
    let mut config = match &cli.config {
        Some(path) => PulzeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PulzeConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.receiver.bind = bind;
    }
    if let Some(group) = cli.multicast_group {
        anyhow::ensure!(group.is_multicast(), "{group} is not a multicast address");
        config.receiver.multicast_group = Some(group);
    }
    if cli.no_multicast {
        config.receiver.multicast_group = None;
    }
    if let Some(port) = cli.keep_alive_port {
        anyhow::ensure!(port != 0, "--keep-alive-port must be nonzero");
        config.keep_alive.peer_port = port;
    }
    Ok(config)
}
