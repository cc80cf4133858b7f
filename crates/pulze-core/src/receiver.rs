//! # Telemetry Receiver
//!
//! Owns the inbound socket and processes one datagram at a time on a single
//! thread:
//!
//! 1. Decode; undecodable datagrams are reported as bogus and skipped
//! 2. Mirror the requested keep-alive interval
//! 3. Fold the packet into the session statistics
//! 4. Request device setting changes the sender asked for
//! 5. Publish a [`StatsSnapshot`]
//!
//! The socket carries a read timeout so the loop can notice a stop request
//! between datagrams. Stopping also tears down any keep-alive session.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::config::PulzeConfig;
use crate::error::{Error, Result};
use crate::events::{DeviceControl, DisplaySink, StatsSnapshot};
use crate::keepalive::KeepAliveManager;
use crate::net::bind_telemetry_socket;
use crate::session::SessionTracker;
use crate::wire::Decoder;

/// Cloneable stop switch for a [`ReceiverLoop`].
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    running: Arc<AtomicBool>,
}

impl ReceiverHandle {
    /// Ask the loop to exit. Idempotent; returns immediately. The loop
    /// notices within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Single-sender telemetry receive loop.
pub struct ReceiverLoop {
    socket: UdpSocket,
    local_addr: SocketAddr,
    decoder: Decoder,
    tracker: SessionTracker,
    keep_alive: KeepAliveManager,
    display: Arc<dyn DisplaySink>,
    device: Arc<dyn DeviceControl>,
    applied_sleep_policy: Option<i32>,
    applied_lock_type: Option<i32>,
    running: Arc<AtomicBool>,
    buf: Vec<u8>,
}

impl ReceiverLoop {
    /// Bind the telemetry socket described by `config.receiver`.
    pub fn bind(
        config: &PulzeConfig,
        display: Arc<dyn DisplaySink>,
        device: Arc<dyn DeviceControl>,
    ) -> Result<Self> {
        let socket = bind_telemetry_socket(&config.receiver)?;
        Self::with_socket(socket, config, display, device)
    }

    /// Use an already-bound socket. Its read timeout is replaced with the
    /// configured poll interval.
    pub fn with_socket(
        socket: UdpSocket,
        config: &PulzeConfig,
        display: Arc<dyn DisplaySink>,
        device: Arc<dyn DeviceControl>,
    ) -> Result<Self> {
        socket
            .set_read_timeout(Some(config.receiver.poll_interval))
            .map_err(|source| Error::SocketOption {
                option: "SO_RCVTIMEO",
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| Error::Bind {
            addr: config.receiver.bind,
            source,
        })?;

        let max_len = config.receiver.max_datagram_len;
        info!(%local_addr, max_len, "telemetry receiver bound");

        Ok(Self {
            socket,
            local_addr,
            decoder: Decoder::new(max_len),
            tracker: SessionTracker::new(),
            keep_alive: KeepAliveManager::new(config.keep_alive.clone(), display.clone()),
            display,
            device,
            applied_sleep_policy: None,
            applied_lock_type: None,
            running: Arc::new(AtomicBool::new(true)),
            // One spare byte so oversized datagrams are seen as oversized
            // rather than silently truncated to the limit.
            buf: vec![0u8; max_len + 1],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            running: self.running.clone(),
        }
    }

    /// Receive and process datagrams until stopped or the socket fails.
    ///
    /// Any keep-alive session is stopped and joined, and the socket closed,
    /// before this returns.
    pub fn run(mut self) -> Result<()> {
        info!(local = %self.local_addr, "receiver running");
        let result = self.receive_until_stopped();

        self.running.store(false, Ordering::Relaxed);
        self.keep_alive.shutdown();
        let stats = self.tracker.stats();
        info!(
            packets = stats.packet_count,
            lost = stats.lost_count(),
            "receiver stopped"
        );
        result
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<RunningReceiver> {
        let handle = self.handle();
        let local_addr = self.local_addr;
        let thread = thread::Builder::new()
            .name("pulze-receiver".into())
            .spawn(move || self.run())
            .map_err(|source| Error::Spawn {
                name: "pulze-receiver",
                source,
            })?;
        Ok(RunningReceiver {
            handle,
            local_addr,
            thread: Some(thread),
        })
    }

    fn receive_until_stopped(&mut self) -> Result<()> {
        while self.running.load(Ordering::Relaxed) {
            let (len, from) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(source) => {
                    error!(error = %source, local = %self.local_addr, "receive failed");
                    return Err(Error::Receive {
                        local: self.local_addr,
                        source,
                    });
                }
            };

            let datagram = std::mem::take(&mut self.buf);
            self.process(&datagram[..len], from);
            self.buf = datagram;
        }
        Ok(())
    }

    fn process(&mut self, datagram: &[u8], from: SocketAddr) {
        let packet = match self.decoder.decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%from, error = %e, "bogus packet");
                self.display.on_bogus_packet();
                return;
            }
        };
        debug!(
            %from,
            seq = packet.sequence(),
            keep_alive_ms = packet.keep_alive_interval_ms(),
            "telemetry packet"
        );

        self.keep_alive.update(packet.keep_alive_interval_ms(), from.ip());

        let stats = self.tracker.observe(&packet, from.port());

        let sleep_policy = packet.sleep_policy();
        if self.applied_sleep_policy != Some(sleep_policy) {
            info!(code = sleep_policy, "applying sleep policy");
            self.applied_sleep_policy = Some(sleep_policy);
            self.device.apply_sleep_policy(sleep_policy);
        }
        let lock_type = packet.lock_type();
        if self.applied_lock_type != Some(lock_type) {
            info!(code = lock_type, "applying lock type");
            self.applied_lock_type = Some(lock_type);
            self.device.apply_lock_type(lock_type);
        }

        let snapshot = StatsSnapshot {
            sequence: packet.sequence(),
            first_sequence: stats.first_seq,
            last_sequence: stats.last_seq,
            packet_count: stats.packet_count,
            lost_count: stats.lost_count(),
            loss_percent: stats.loss_percent(),
            keep_alive_interval: self.keep_alive.current_interval(),
            sleep_policy,
            lock_type,
            display_interval: packet.display_interval(),
        };
        self.display.on_stats_updated(&snapshot);
    }
}

/// A [`ReceiverLoop`] running on its own thread.
pub struct RunningReceiver {
    handle: ReceiverHandle,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<Result<()>>>,
}

impl RunningReceiver {
    pub fn handle(&self) -> ReceiverHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the loop thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for its thread, returning how it ended.
    /// Later calls return `Ok(())`.
    pub fn stop(&mut self) -> Result<()> {
        self.handle.stop();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().map_err(|_| Error::Panicked {
            name: "pulze-receiver",
        })?
    }
}

impl Drop for RunningReceiver {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "receiver ended with error");
        }
    }
}
