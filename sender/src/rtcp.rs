//! RTCP sender reports.
//!
//! Every `sr_interval_ms` the sender emits SR + SDES CNAME to the RTCP
//! port of the destination (RTP port + 1). The SR pairs the current wall
//! clock with the RTP timestamp extrapolated from the last packet sent, so
//! receivers can map the stream onto their own clock. On shutdown an SR +
//! BYE goes out.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use scream_rtp_common::net::bind_sender;
use scream_rtp_common::rtcp::{encode_bye, encode_sdes_cname, NtpTimestamp, SenderReport};
use scream_rtp_common::{ConfigProvider, SenderMetrics, Shutdown, WallClock};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::network::MULTICAST_TTL;

/// What the transmitter has sent so far; read by the SR builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStatus {
    // ---
    pub packets: u32,
    pub octets: u32,
    pub last_timestamp: u32,

    /// Monotonic time of the last packet; 0 before the first one.
    pub last_send_mono_us: u64,
}

impl SendStatus {
    // ---
    /// Records one sent packet carrying `payload_bytes` of audio.
    pub fn record(&mut self, timestamp: u32, payload_bytes: usize, mono_us: u64) {
        // ---
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(payload_bytes as u32);
        self.last_timestamp = timestamp;
        self.last_send_mono_us = mono_us;
    }

    pub fn has_sent(&self) -> bool {
        // ---
        self.last_send_mono_us != 0
    }
}

/// Builds the SR for `status` at the given clock readings.
///
/// Returns `None` until the first packet has gone out; there is no
/// timestamp to report before that.
pub fn build_sender_report(
    ssrc: u32,
    status: &SendStatus,
    wall_us: i64,
    mono_us: u64,
    sample_rate: u32,
) -> Option<SenderReport> {
    // ---
    if !status.has_sent() {
        return None;
    }
    let elapsed_us = mono_us.saturating_sub(status.last_send_mono_us);
    let ticks = (elapsed_us as u128 * sample_rate as u128 / 1_000_000) as u32;

    Some(SenderReport {
        ssrc,
        ntp: NtpTimestamp::from_unix_us(wall_us),
        rtp_timestamp: status.last_timestamp.wrapping_add(ticks),
        packet_count: status.packets,
        octet_count: status.octets,
        reports: Vec::new(),
    })
}

/// Periodic SR emitter for one send session.
pub struct RtcpSender<P: ConfigProvider> {
    // ---
    socket: UdpSocket,
    ssrc: u32,
    cname: String,
    sample_rate: u32,
    status: Arc<Mutex<SendStatus>>,
    config: P,
    clock: Arc<dyn WallClock>,
    metrics: SenderMetrics,
    reports_sent: u64,
}

impl<P: ConfigProvider> RtcpSender<P> {
    // ---
    /// # Errors
    ///
    /// Returns error if the send socket cannot be created.
    pub fn new(
        ssrc: u32,
        status: Arc<Mutex<SendStatus>>,
        config: P,
        clock: Arc<dyn WallClock>,
        metrics: SenderMetrics,
    ) -> Result<Self> {
        // ---
        let cfg = config.current();
        let socket = bind_sender(MULTICAST_TTL)?;
        Ok(Self {
            socket,
            ssrc,
            cname: cfg.device_name.clone(),
            sample_rate: cfg.sample_rate,
            status,
            config,
            clock,
            metrics,
            reports_sent: 0,
        })
    }

    /// RTCP address for the configured destination.
    fn destination(&self) -> SocketAddrV4 {
        // ---
        let dest = self.config.current().sender_destination();
        SocketAddrV4::new(*dest.ip(), dest.port().wrapping_add(1))
    }

    /// Builds the compound packet; SR first, then SDES or BYE.
    fn compound(&self, bye: bool) -> Option<Vec<u8>> {
        // ---
        let status = *self.status.lock();
        let sr = build_sender_report(
            self.ssrc,
            &status,
            self.clock.now_wall_us(),
            self.clock.now_monotonic_us(),
            self.sample_rate,
        )?;

        let mut out = Vec::with_capacity(64 + self.cname.len());
        sr.encode(&mut out);
        if bye {
            encode_bye(&[self.ssrc], &mut out);
        } else {
            encode_sdes_cname(self.ssrc, &self.cname, &mut out);
        }
        Some(out)
    }

    async fn send(&mut self, bye: bool) {
        // ---
        let Some(packet) = self.compound(bye) else {
            debug!("No RTP sent yet, skipping sender report");
            return;
        };
        let dest = self.destination();
        match self.socket.send_to(&packet, SocketAddr::V4(dest)).await {
            Ok(_) => {
                self.reports_sent += 1;
                self.metrics.rtcp_sr_sent_total.inc();
                if self.reports_sent == 1 {
                    info!("Sending RTCP sender reports to {}", dest);
                }
            }
            Err(e) => warn!("Failed to send RTCP to {}: {}", dest, e),
        }
    }

    /// Sends reports every `interval` until `shutdown` clears, then a BYE.
    pub async fn run(mut self, interval: Duration, shutdown: Shutdown) {
        // ---
        while shutdown.sleep(interval).await {
            self.send(false).await;
        }
        self.send(true).await;
        info!("RTCP sender stopped after {} reports (BYE sent)", self.reports_sent);
    }
}
