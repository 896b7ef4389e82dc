//! UDP transmission of paced RTP packets.
//!
//! [`RtpSender`] owns the send socket and the multicast membership of the
//! destination. [`Transmitter`] is the async loop that ticks the pacer
//! once per packet period and follows configuration changes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use scream_rtp_common::config::validate_destination;
use scream_rtp_common::net::{bind_sender, is_multicast, leave_multicast};
use scream_rtp_common::{ConfigProvider, CoreError, NodeConfig, SenderMetrics, Shutdown, WallClock};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audio::SampleSource;
use crate::pacer::{Pacer, PacerTick, PcmTap};
use crate::rtcp::SendStatus;

/// Multicast TTL for RTP.
pub const MULTICAST_TTL: u32 = 15;

/// Pause before the single retry of a transient send failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Send failures logged individually before falling back to counters.
const MAX_WARNINGS: u64 = 10;

/// Outcome of one packet transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    Dropped,
}

/// Transmission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub retries: u64,
    pub drops: u64,
}

/// UDP sender for RTP packets.
///
/// Sends are non-blocking. A transient failure (`EAGAIN`, `ENOMEM`) is
/// retried once after a short backoff; anything else drops the packet.
pub struct RtpSender {
    // ---
    socket: UdpSocket,
    destination: SocketAddrV4,
    joined: Option<Ipv4Addr>,
    metrics: SenderMetrics,
    stats: SendStats,
}

impl RtpSender {
    // ---
    /// Creates the send socket and joins `destination` if it is multicast.
    ///
    /// # Errors
    ///
    /// Returns error if the destination is invalid or the socket cannot be
    /// created.
    pub fn new(destination: SocketAddrV4, metrics: SenderMetrics) -> Result<Self> {
        // ---
        validate_destination(*destination.ip()).context("invalid RTP destination")?;
        let socket = bind_sender(MULTICAST_TTL)?;
        let mut sender = Self {
            socket,
            destination,
            joined: None,
            metrics,
            stats: SendStats::default(),
        };
        if is_multicast(*destination.ip()) {
            if let Err(e) = sender.join(*destination.ip()) {
                // Sending to a group works without membership.
                warn!("{:#}", e);
            }
        }
        info!(
            "Sending RTP to {}{}",
            destination,
            if is_multicast(*destination.ip()) { " (multicast)" } else { "" }
        );
        Ok(sender)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        // ---
        self.destination
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        // ---
        self.socket.local_addr()
    }

    pub fn stats(&self) -> SendStats {
        // ---
        self.stats
    }

    fn join(&mut self, group: Ipv4Addr) -> Result<()> {
        // ---
        self.socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("failed to join multicast group {}", group))?;
        self.joined = Some(group);
        info!("Joined multicast group {}", group);
        Ok(())
    }

    fn leave(&mut self) {
        // ---
        if let Some(group) = self.joined.take() {
            match leave_multicast(&self.socket, group) {
                Ok(()) => info!("Left multicast group {}", group),
                Err(e) => warn!("Failed to leave multicast group {}, continuing anyway: {}", group, e),
            }
        }
    }

    /// Switches to a new destination.
    ///
    /// A multicast destination is joined before the previous group is left,
    /// so a failed join keeps the previous destination active.
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid or the group cannot be
    /// joined; the previous destination stays in use.
    pub fn update_destination(&mut self, destination: SocketAddrV4) -> Result<()> {
        // ---
        if destination == self.destination {
            return Ok(());
        }
        let ip = *destination.ip();
        validate_destination(ip).context("invalid RTP destination")?;
        if destination.port() == 0 {
            anyhow::bail!("invalid RTP destination port 0");
        }

        if is_multicast(ip) && self.joined != Some(ip) {
            self.socket
                .join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)
                .with_context(|| format!("failed to join multicast group {}, keeping {}", ip, self.destination))?;
            self.leave();
            self.joined = Some(ip);
            info!("Joined multicast group {}", ip);
        } else if !is_multicast(ip) {
            self.leave();
        }

        info!(
            "Updated RTP destination {} -> {}{}",
            self.destination,
            destination,
            if is_multicast(ip) { " (multicast)" } else { "" }
        );
        self.destination = destination;
        Ok(())
    }

    /// Sends one packet to the current destination.
    pub async fn send(&mut self, packet: &[u8]) -> SendOutcome {
        // ---
        let dest = SocketAddr::V4(self.destination);
        let first = match self.socket.try_send_to(packet, dest) {
            Ok(n) => return self.record_sent(n),
            Err(e) => CoreError::from(e),
        };

        let err = if first.is_transient() {
            self.stats.retries += 1;
            self.metrics.send_retries_total.inc();
            tokio::time::sleep(RETRY_BACKOFF).await;
            match self.socket.try_send_to(packet, dest) {
                Ok(n) => return self.record_sent(n),
                Err(e) => CoreError::from(e),
            }
        } else {
            first
        };

        self.stats.drops += 1;
        self.metrics.send_drops_total.inc();
        if self.stats.drops <= MAX_WARNINGS {
            warn!("Failed to send RTP packet to {}: {}", dest, err);
        }
        SendOutcome::Dropped
    }

    fn record_sent(&mut self, bytes: usize) -> SendOutcome {
        // ---
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.metrics.packets_sent_total.inc();
        self.metrics.bytes_sent_total.inc_by(bytes as u64);
        SendOutcome::Sent(bytes)
    }
}

impl Drop for RtpSender {
    fn drop(&mut self) {
        // ---
        self.leave();
    }
}

/// The send loop: one pacer tick per packet period.
pub struct Transmitter<S: SampleSource, T: PcmTap, P: ConfigProvider> {
    // ---
    pacer: Pacer<S, T>,
    sender: RtpSender,
    config: P,
    status: Arc<Mutex<SendStatus>>,
    clock: Arc<dyn WallClock>,
    period: Duration,
}

impl<S, T, P> Transmitter<S, T, P>
where
    S: SampleSource + Send + 'static,
    T: PcmTap + Send + 'static,
    P: ConfigProvider + 'static,
{
    // ---
    pub fn new(
        pacer: Pacer<S, T>,
        sender: RtpSender,
        config: P,
        status: Arc<Mutex<SendStatus>>,
        clock: Arc<dyn WallClock>,
        period: Duration,
    ) -> Self {
        // ---
        Self {
            pacer,
            sender,
            config,
            status,
            clock,
            period,
        }
    }

    fn apply_config(&mut self, prev: &NodeConfig, next: &NodeConfig) {
        // ---
        if prev.sender_destination() != next.sender_destination() {
            if let Err(e) = self.sender.update_destination(next.sender_destination()) {
                warn!("Destination update rejected: {:#}", e);
            }
        }
        if prev.muted != next.muted {
            info!("Sender {}", if next.muted { "muted" } else { "unmuted" });
        }
        if prev.volume != next.volume {
            info!("Sender volume {:.2}", next.volume);
        }
    }

    /// Runs until `shutdown` clears.
    pub async fn run(mut self, shutdown: Shutdown) {
        // ---
        let mut config_rx = self.config.subscribe();
        let mut cfg = config_rx.borrow_and_update().clone();
        let mut config_open = true;

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        debug!("Pacing every {:?}", self.period);

        loop {
            let config_changed = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => false,
                changed = config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        false
                    } else {
                        true
                    }
                }
            };

            if config_changed {
                let next = config_rx.borrow_and_update().clone();
                self.apply_config(&cfg, &next);
                cfg = next;
                continue;
            }

            if let PacerTick::Ready { timestamp, .. } = self.pacer.tick(cfg.volume, cfg.muted) {
                if let SendOutcome::Sent(_) = self.sender.send(self.pacer.packet()).await {
                    let payload = self.pacer.packet().len().saturating_sub(12);
                    self.status
                        .lock()
                        .record(timestamp, payload, self.clock.now_monotonic_us());
                }
            }
        }

        let pacer = self.pacer.stats();
        let sent = self.sender.stats();
        info!(
            "Transmission stopped: {} packets, {} bytes, {} underflows, {} retries, {} drops",
            sent.packets_sent, sent.bytes_sent, pacer.underflows, sent.retries, sent.drops
        );
    }
}
