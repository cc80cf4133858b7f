//! # Pulze Sender
//!
//! Broadcasts sequence-numbered telemetry at a fixed interval so a receiver
//! can measure loss, and optionally counts the keep-alive heartbeats the
//! receiver sends back.
//!
//! ## Usage
//!
//! ```bash
//! # One packet per second to the LAN broadcast address
//! pulze-sender
//!
//! # 20 ms cadence, 1 KiB padding, ask for 50 ms heartbeats and count them
//! pulze-sender --send-interval 20 --payload-size 1004 \
//!     --keep-alive-interval 50 --listen-keep-alive
//!
//! # Straight at one receiver
//! pulze-sender --dest 192.168.1.40:51423
//! ```

mod packet;

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pulze_core::wire::{DEFAULT_MAX_PACKET_LEN, KEEP_ALIVE_SENTINEL, TELEMETRY_PORT};

use crate::packet::TelemetryFrame;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Pulze telemetry sender.
#[derive(Parser, Debug)]
#[command(name = "pulze-sender", about = "Pulze link-quality probe sender")]
struct Cli {
    /// Destination for telemetry (broadcast, multicast or unicast).
    #[arg(long, short = 'd', default_value_t = SocketAddr::from(([255, 255, 255, 255], TELEMETRY_PORT)))]
    dest: SocketAddr,

    /// Local address to send from.
    #[arg(long, short = 'b', default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Milliseconds between packets; 0 sends as fast as possible.
    #[arg(long, default_value_t = 1000)]
    send_interval: u64,

    /// Heartbeat period requested from receivers, in ms; 0 disables.
    #[arg(long, default_value_t = 100)]
    keep_alive_interval: i32,

    /// Wi-Fi sleep policy code requested from receivers.
    #[arg(long, default_value_t = 0)]
    sleep_policy: i32,

    /// Wi-Fi lock type code requested from receivers.
    #[arg(long, default_value_t = 1)]
    lock_type: i32,

    /// Filler bytes appended after the 20-byte header.
    #[arg(long, default_value_t = 0)]
    payload_size: usize,

    /// Display refresh interval advertised to receivers, in ms.
    /// Defaults to the send interval.
    #[arg(long)]
    display_interval: Option<i32>,

    /// Stop after this many packets.
    #[arg(long)]
    count: Option<u64>,

    /// Count keep-alive heartbeats arriving on this port (0 disables).
    #[arg(long, default_value_t = 0, num_args = 0..=1, default_missing_value = "13337")]
    listen_keep_alive: u16,
}

impl Cli {
    fn display_interval_ms(&self) -> i32 {
        self.display_interval
            .unwrap_or_else(|| i32::try_from(self.send_interval).unwrap_or(i32::MAX))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let datagram_len = TelemetryFrame::encoded_len(cli.payload_size);
    if datagram_len > DEFAULT_MAX_PACKET_LEN {
        tracing::warn!(
            datagram_len,
            max = DEFAULT_MAX_PACKET_LEN,
            "datagrams exceed the default receiver limit and will be counted as bogus"
        );
    }

    // ── Socket ──────────────────────────────────────────────────
    let socket =
        UdpSocket::bind(cli.bind).with_context(|| format!("failed to bind {}", cli.bind))?;
    socket
        .set_broadcast(true)
        .context("failed to enable SO_BROADCAST")?;
    if cli.dest.ip().is_multicast() {
        socket
            .set_multicast_loop_v4(true)
            .context("failed to enable multicast loopback")?;
    }

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

    let listener = if cli.listen_keep_alive != 0 {
        Some(spawn_heartbeat_listener(cli.listen_keep_alive, running.clone())?)
    } else {
        None
    };

    tracing::info!(
        dest = %cli.dest,
        local = %socket.local_addr()?,
        interval_ms = cli.send_interval,
        keep_alive_ms = cli.keep_alive_interval,
        datagram_len,
        "pulze-sender starting"
    );

    // ── Send loop ───────────────────────────────────────────────
    let sent = send_loop(&cli, &socket, &running);

    running.store(false, Ordering::Relaxed);
    if let Some(handle) = listener {
        if handle.join().is_err() {
            tracing::warn!("heartbeat listener panicked");
        }
    }
    tracing::info!(sent, "pulze-sender stopped");
    Ok(())
}

/// Send until stopped or `--count` is reached. Returns the number of packets
/// sent.
///
/// Deadlines advance by a fixed step from the start time so that a slow send
/// does not push every later packet back.
fn send_loop(cli: &Cli, socket: &UdpSocket, running: &AtomicBool) -> u64 {
    let interval = Duration::from_millis(cli.send_interval);
    let mut frame = TelemetryFrame {
        sequence: 0,
        display_interval_ms: cli.display_interval_ms(),
        keep_alive_interval_ms: cli.keep_alive_interval,
        sleep_policy: cli.sleep_policy,
        lock_type: cli.lock_type,
    };
    let mut buf = BytesMut::with_capacity(TelemetryFrame::encoded_len(cli.payload_size));

    let mut sent: u64 = 0;
    let mut send_errors: u64 = 0;
    let mut window = RateWindow::new();
    let mut deadline = Instant::now();

    while running.load(Ordering::Relaxed) && cli.count.is_none_or(|n| sent < n) {
        frame.sequence = frame.sequence.wrapping_add(1);
        frame.encode_into(cli.payload_size, &mut buf);

        match socket.send_to(&buf, cli.dest) {
            Ok(n) => {
                sent += 1;
                window.record(n);
            }
            Err(e) => {
                send_errors += 1;
                tracing::warn!(seq = frame.sequence, error = %e, "send failed");
            }
        }

        if let Some(rate) = window.take_if_due(REPORT_INTERVAL) {
            tracing::info!(
                seq = frame.sequence,
                sent,
                send_errors,
                pps = format_args!("{:.1}", rate.packets_per_sec),
                kbps = format_args!("{:.1}", rate.kbits_per_sec),
                "data rate"
            );
        }

        if !interval.is_zero() {
            deadline += interval;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                // Fell behind by more than one step; restart the schedule
                // rather than bursting to catch up.
                deadline = now;
            }
        }
    }
    sent
}

/// Throughput accumulated since the last report.
struct RateWindow {
    started: Instant,
    packets: u64,
    bytes: u64,
}

struct Rate {
    packets_per_sec: f64,
    kbits_per_sec: f64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            packets: 0,
            bytes: 0,
        }
    }

    fn record(&mut self, len: usize) {
        self.packets += 1;
        self.bytes += len as u64;
    }

    fn take_if_due(&mut self, every: Duration) -> Option<Rate> {
        let elapsed = self.started.elapsed();
        if elapsed < every {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        let rate = Rate {
            packets_per_sec: self.packets as f64 / secs,
            kbits_per_sec: (self.bytes * 8) as f64 / secs / 1000.0,
        };
        *self = Self::new();
        Some(rate)
    }
}

/// Count keep-alive heartbeats per receiver until `running` clears.
fn spawn_heartbeat_listener(
    port: u16,
    running: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let bind = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = UdpSocket::bind(bind)
        .with_context(|| format!("failed to bind heartbeat listener on {bind}"))?;
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .context("failed to set heartbeat listener timeout")?;
    tracing::info!(%bind, "listening for keep-alive heartbeats");

    thread::Builder::new()
        .name("pulze-heartbeats".into())
        .spawn(move || {
            let mut counts = HeartbeatCounts::default();
            let mut last_report = Instant::now();
            let mut buf = [0u8; 64];

            while running.load(Ordering::Relaxed) {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => counts.record(&buf[..n], from),
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "heartbeat listener recv failed");
                        thread::sleep(Duration::from_millis(100));
                    }
                }

                if last_report.elapsed() >= REPORT_INTERVAL {
                    counts.report();
                    last_report = Instant::now();
                }
            }
            counts.report();
        })
        .context("failed to spawn heartbeat listener")
}

/// Heartbeats seen per receiver address, plus anything that wasn't one.
#[derive(Debug, Default)]
struct HeartbeatCounts {
    per_peer: HashMap<SocketAddr, u64>,
    malformed: u64,
}

impl HeartbeatCounts {
    fn record(&mut self, datagram: &[u8], from: SocketAddr) {
        if datagram == [KEEP_ALIVE_SENTINEL] {
            *self.per_peer.entry(from).or_default() += 1;
        } else {
            self.malformed += 1;
            tracing::debug!(%from, len = datagram.len(), "ignoring non-heartbeat datagram");
        }
    }

    fn report(&self) {
        for (peer, count) in &self.per_peer {
            tracing::info!(%peer, heartbeats = count, "keep-alive");
        }
        if self.malformed > 0 {
            tracing::info!(malformed = self.malformed, "non-heartbeat datagrams");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulze_core::wire::{KEEP_ALIVE_PORT, MIN_PACKET_LEN};

    #[test]
    fn defaults_target_lan_broadcast() {
        let cli = Cli::parse_from(["pulze-sender"]);
        assert_eq!(cli.dest, "255.255.255.255:51423".parse().unwrap());
        assert_eq!(cli.send_interval, 1000);
        assert_eq!(cli.keep_alive_interval, 100);
        assert_eq!(cli.display_interval_ms(), 1000);
        assert_eq!(cli.listen_keep_alive, 0);
        assert_eq!(TelemetryFrame::encoded_len(cli.payload_size), MIN_PACKET_LEN);
    }

    #[test]
    fn bare_listen_flag_uses_keep_alive_port() {
        let cli = Cli::parse_from(["pulze-sender", "--listen-keep-alive"]);
        assert_eq!(cli.listen_keep_alive, KEEP_ALIVE_PORT);

        let cli = Cli::parse_from(["pulze-sender", "--listen-keep-alive", "14000"]);
        assert_eq!(cli.listen_keep_alive, 14000);
    }

    #[test]
    fn heartbeats_counted_per_peer() {
        let a: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let b: SocketAddr = "10.0.0.3:40000".parse().unwrap();
        let mut counts = HeartbeatCounts::default();
        counts.record(&[KEEP_ALIVE_SENTINEL], a);
        counts.record(&[KEEP_ALIVE_SENTINEL], a);
        counts.record(&[KEEP_ALIVE_SENTINEL], b);
        counts.record(&[0x00], b);
        counts.record(&[KEEP_ALIVE_SENTINEL, KEEP_ALIVE_SENTINEL], b);

        assert_eq!(counts.per_peer[&a], 2);
        assert_eq!(counts.per_peer[&b], 1);
        assert_eq!(counts.malformed, 2);
    }

    #[test]
    fn send_loop_honours_count() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let dest = rx.local_addr().unwrap().to_string();

        let cli = Cli::parse_from([
            "pulze-sender",
            "--dest",
            dest.as_str(),
            "--bind",
            "127.0.0.1:0",
            "--send-interval",
            "0",
            "--count",
            "3",
            "--payload-size",
            "10",
        ]);
        let tx = UdpSocket::bind(cli.bind).unwrap();
        let running = AtomicBool::new(true);
        assert_eq!(send_loop(&cli, &tx, &running), 3);

        let mut buf = [0u8; 64];
        for expected in 1..=3 {
            let n = rx.recv(&mut buf).unwrap();
            assert_eq!(n, MIN_PACKET_LEN + 10);
            let pkt = pulze_core::wire::decode(&buf[..n]).unwrap();
            assert_eq!(pkt.sequence(), expected);
            assert_eq!(pkt.keep_alive_interval_ms(), 100);
        }
    }

    #[test]
    fn send_loop_exits_when_stopped() {
        let cli = Cli::parse_from(["pulze-sender", "--dest", "127.0.0.1:9"]);
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let running = AtomicBool::new(false);
        assert_eq!(send_loop(&cli, &tx, &running), 0);
    }
}
