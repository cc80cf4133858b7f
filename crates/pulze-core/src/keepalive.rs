//! # Keep-Alive Heartbeats
//!
//! The sender decides whether the receiver answers with heartbeats and how
//! often, through the keep-alive field of every telemetry packet. The
//! receiver just mirrors the latest value:
//!
//! ```text
//!   Inactive ──interval > 0──▶ Active(interval)
//!      ▲                            │
//!      └────interval changed────────┘   (then restart if the new value > 0)
//! ```
//!
//! Each [`KeepAliveSession`] owns one thread and one socket and is never
//! restarted; a changed interval always means a fresh session.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::KeepAliveConfig;
use crate::events::DisplaySink;
use crate::wire::{KEEP_ALIVE_SENTINEL, interval_from_ms};

#[derive(Debug, Error)]
pub enum KeepAliveError {
    #[error("failed to open keep-alive socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn keep-alive thread")]
    Spawn(#[source] io::Error),
}

// ─── Session ────────────────────────────────────────────────────────────────

/// One running heartbeat stream to a single peer.
pub struct KeepAliveSession {
    peer: SocketAddr,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    sent: Arc<AtomicU64>,
}

impl KeepAliveSession {
    /// Open the heartbeat socket on `bind` and start sending to `peer`.
    ///
    /// The first heartbeat goes out immediately, then one per `interval`.
    pub fn start(
        peer: SocketAddr,
        interval: Duration,
        bind: SocketAddr,
    ) -> Result<Self, KeepAliveError> {
        let socket =
            UdpSocket::bind(bind).map_err(|source| KeepAliveError::Bind { addr: bind, source })?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let sent = Arc::new(AtomicU64::new(0));
        let sent_clone = sent.clone();

        let handle = thread::Builder::new()
            .name("pulze-keepalive".into())
            .spawn(move || heartbeat_loop(socket, peer, interval, stop_rx, sent_clone))
            .map_err(KeepAliveError::Spawn)?;

        info!(%peer, interval_ms = interval.as_millis() as u64, "keep-alive started");

        Ok(Self {
            peer,
            interval,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            sent,
        })
    }

    /// Stop the heartbeat thread and wait for it to exit. Calling this on a
    /// stopped session does nothing.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Dropping the sender wakes the worker out of its sleep.
        drop(self.stop_tx.take());
        if handle.join().is_err() {
            warn!(peer = %self.peer, "keep-alive thread panicked");
        }
        info!(
            peer = %self.peer,
            interval_ms = self.interval.as_millis() as u64,
            sent = self.heartbeats_sent(),
            "keep-alive stopped"
        );
    }

    /// Whether the heartbeat thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Drop for KeepAliveSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn heartbeat_loop(
    socket: UdpSocket,
    peer: SocketAddr,
    interval: Duration,
    stop_rx: Receiver<()>,
    sent: Arc<AtomicU64>,
) {
    let payload = [KEEP_ALIVE_SENTINEL];
    loop {
        match socket.send_to(&payload, peer) {
            Ok(_) => {
                let n = sent.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(%peer, n, "heartbeat sent");
            }
            Err(e) => warn!(%peer, error = %e, "heartbeat send failed, retrying next tick"),
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(%peer, "heartbeat loop exited");
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// What a call to [`KeepAliveManager::update`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveTransition {
    /// Interval of the session that was stopped.
    pub stopped: Option<Duration>,
    /// Interval of the session that was started.
    pub started: Option<Duration>,
}

impl KeepAliveTransition {
    pub fn is_noop(&self) -> bool {
        self.stopped.is_none() && self.started.is_none()
    }
}

/// Owns at most one [`KeepAliveSession`] and keeps it in line with the
/// interval requested by the latest packet.
///
/// Only the receiver thread calls into the manager, so it needs no locking.
pub struct KeepAliveManager {
    config: KeepAliveConfig,
    display: Arc<dyn DisplaySink>,
    session: Option<KeepAliveSession>,
    /// Raw interval whose session failed to open; not retried until the
    /// sender asks for something else.
    failed_ms: Option<i32>,
}

impl KeepAliveManager {
    pub fn new(config: KeepAliveConfig, display: Arc<dyn DisplaySink>) -> Self {
        Self {
            config,
            display,
            session: None,
            failed_ms: None,
        }
    }

    /// Apply the keep-alive interval from one decoded packet. `peer` is the
    /// address the packet came from.
    pub fn update(&mut self, requested_ms: i32, peer: IpAddr) -> KeepAliveTransition {
        let requested = interval_from_ms(requested_ms);
        let mut transition = KeepAliveTransition::default();

        if self.failed_ms.is_some_and(|ms| ms != requested_ms) {
            self.failed_ms = None;
        }

        if self
            .session
            .as_ref()
            .is_some_and(|s| Some(s.interval()) != requested)
        {
            if let Some(mut session) = self.session.take() {
                session.stop();
                transition.stopped = Some(session.interval());
                self.display.on_keep_alive_state_changed(None);
            }
        }

        if self.session.is_none() && self.failed_ms.is_none() {
            if let Some(interval) = requested {
                let target = SocketAddr::new(peer, self.config.peer_port);
                match KeepAliveSession::start(target, interval, self.config.bind) {
                    Ok(session) => {
                        self.session = Some(session);
                        transition.started = Some(interval);
                        self.display.on_keep_alive_state_changed(Some(interval));
                    }
                    Err(e) => {
                        warn!(error = %e, %target, "keep-alive session failed to start");
                        self.failed_ms = Some(requested_ms);
                    }
                }
            }
        }

        transition
    }

    /// Interval of the running session, if any.
    pub fn current_interval(&self) -> Option<Duration> {
        self.session.as_ref().map(KeepAliveSession::interval)
    }

    pub fn session(&self) -> Option<&KeepAliveSession> {
        self.session.as_ref()
    }

    /// Stop and join the running session. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
            self.display.on_keep_alive_state_changed(None);
        }
    }
}

impl Drop for KeepAliveManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, ReceiverEvent};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn peer_listener() -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        sock
    }

    fn loopback_config(peer_port: u16) -> KeepAliveConfig {
        KeepAliveConfig {
            peer_port,
            bind: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[test]
    fn session_sends_sentinel_byte() {
        let listener = peer_listener();
        let peer = listener.local_addr().unwrap();
        let mut session = KeepAliveSession::start(
            peer,
            Duration::from_millis(10),
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let (n, _) = listener.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[KEEP_ALIVE_SENTINEL]);
        }
        session.stop();
        assert!(session.heartbeats_sent() >= 3);
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let listener = peer_listener();
        let mut session = KeepAliveSession::start(
            listener.local_addr().unwrap(),
            Duration::from_secs(30),
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();
        assert!(session.is_running());

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!session.is_running());

        session.stop();
        assert!(!session.is_running());
    }

    #[test]
    fn send_failures_do_not_end_session() {
        // An IPv4 socket cannot address an IPv6 peer, so every send fails.
        let mut session = KeepAliveSession::start(
            "[::1]:9".parse().unwrap(),
            Duration::from_millis(5),
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();

        for _ in 0..5 {
            thread::sleep(Duration::from_millis(10));
            assert!(session.is_running());
        }
        assert_eq!(session.heartbeats_sent(), 0);

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.is_running());
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let result = KeepAliveSession::start(
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(10),
            taken.local_addr().unwrap(),
        );
        assert!(matches!(result, Err(KeepAliveError::Bind { .. })));
    }

    #[test]
    fn manager_follows_requested_intervals() {
        let listener = peer_listener();
        let port = listener.local_addr().unwrap().port();
        let (sink, events) = ChannelSink::new(16);
        let mut mgr = KeepAliveManager::new(loopback_config(port), Arc::new(sink));

        let ms = Duration::from_millis;
        let steps: Vec<_> = [0, 50, 50, 75, 0]
            .into_iter()
            .map(|v| mgr.update(v, LOCALHOST))
            .collect();

        assert_eq!(
            steps,
            vec![
                KeepAliveTransition::default(),
                KeepAliveTransition {
                    stopped: None,
                    started: Some(ms(50))
                },
                KeepAliveTransition::default(),
                KeepAliveTransition {
                    stopped: Some(ms(50)),
                    started: Some(ms(75))
                },
                KeepAliveTransition {
                    stopped: Some(ms(75)),
                    started: None
                },
            ]
        );
        assert_eq!(mgr.current_interval(), None);

        let changes: Vec<_> = events
            .try_iter()
            .map(|e| match e {
                ReceiverEvent::KeepAliveChanged { interval } => interval,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(changes, vec![Some(ms(50)), None, Some(ms(75)), None]);
    }

    #[test]
    fn negative_interval_counts_as_disabled() {
        let listener = peer_listener();
        let port = listener.local_addr().unwrap().port();
        let mut mgr = KeepAliveManager::new(loopback_config(port), Arc::new(ChannelSink::new(8).0));

        assert!(mgr.update(-10, LOCALHOST).is_noop());
        mgr.update(20, LOCALHOST);
        let t = mgr.update(-10, LOCALHOST);
        assert_eq!(t.stopped, Some(Duration::from_millis(20)));
        assert_eq!(t.started, None);
    }

    #[test]
    fn failed_start_waits_for_new_interval() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = KeepAliveConfig {
            peer_port: 9,
            bind: taken.local_addr().unwrap(),
        };
        let (sink, events) = ChannelSink::new(8);
        let mut mgr = KeepAliveManager::new(config, Arc::new(sink));

        assert!(mgr.update(50, LOCALHOST).is_noop());
        assert!(mgr.update(50, LOCALHOST).is_noop());
        assert_eq!(mgr.current_interval(), None);
        assert_eq!(events.try_iter().count(), 0);
    }

    #[test]
    fn shutdown_stops_session_once() {
        let listener = peer_listener();
        let port = listener.local_addr().unwrap().port();
        let (sink, events) = ChannelSink::new(8);
        let mut mgr = KeepAliveManager::new(loopback_config(port), Arc::new(sink));

        mgr.update(40, LOCALHOST);
        mgr.shutdown();
        mgr.shutdown();
        assert!(mgr.session().is_none());
        assert_eq!(events.try_iter().count(), 2);
    }
}
