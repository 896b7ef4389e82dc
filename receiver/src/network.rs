//! UDP ingress: RTP and RTCP reception.
//!
//! The unicast RTP/RTCP socket pair on `port`/`port + 1` is always open.
//! Session control can additionally point the ingress at a multicast
//! group; the join happens here, on the task that owns the sockets.
//!
//! Datagram handling is split from socket I/O: [`RtpDispatcher`] is plain
//! synchronous code that the async [`Ingress`] loop feeds, so the whole
//! receive path can be driven from tests without sockets.

use std::future::pending;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use scream_rtp_common::net::{bind_multicast, bind_reusable, leave_multicast};
use scream_rtp_common::rtcp::{parse_compound, RtcpPacket};
use scream_rtp_common::{ConfigProvider, EventBus, NodeConfig, ParseError, ReceiverMetrics, RtpView, Shutdown};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::jitter_buffer::{PushOutcome, SharedJitterBuffer};
use crate::stats::IngressStats;
use crate::sync::SyncEngine;

/// RTCP receive buffer size.
pub const RTCP_BUFFER_SIZE: usize = 512;

/// Hot-path warnings logged before falling back to counters only.
const MAX_WARNINGS: u64 = 10;

/// Where the receive pipeline should take its stream from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamTarget {
    /// Only the unicast socket on the configured port.
    #[default]
    Unicast,

    /// Join `group` and listen on `port`, preferring the SSRC `ssrc_filter`.
    Multicast {
        group: Ipv4Addr,
        port: u16,
        ssrc_filter: Option<u32>,
    },
}

/// What happened to one RTP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpDisposition {
    /// Pushed to the jitter buffer.
    Queued { synchronized: bool },

    /// Tracked for RTCP but not played.
    NonPrimary,

    /// Payload was not exactly one chunk.
    SizeMismatch,

    Malformed(ParseError),

    /// Every SSRC slot is pinned; the packet could not be tracked.
    Untracked,
}

/// Synchronous datagram handling shared by all receive sockets.
pub struct RtpDispatcher {
    // ---
    sync: Arc<SyncEngine>,
    buffer: SharedJitterBuffer,
    metrics: ReceiverMetrics,
    events: EventBus,
    stats: IngressStats,
    scratch: Vec<u8>,
    chunk_bytes: usize,
    last_underruns: u64,
}

impl RtpDispatcher {
    // ---
    pub fn new(
        sync: Arc<SyncEngine>,
        buffer: SharedJitterBuffer,
        metrics: ReceiverMetrics,
        events: EventBus,
    ) -> Self {
        // ---
        let chunk_bytes = buffer.lock().config().chunk_bytes;
        Self {
            sync,
            buffer,
            metrics,
            events,
            stats: IngressStats::default(),
            scratch: vec![0u8; chunk_bytes],
            chunk_bytes,
            last_underruns: 0,
        }
    }

    pub fn stats(&self) -> &IngressStats {
        // ---
        &self.stats
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        // ---
        &self.sync
    }

    /// Parses one RTP datagram and queues its payload if it belongs to the
    /// primary SSRC.
    ///
    /// # Arguments
    ///
    /// * `datagram` - Raw UDP payload
    /// * `from` - Source address, remembered for receiver reports
    pub fn handle_rtp(&mut self, datagram: &[u8], from: Option<SocketAddr>) -> RtpDisposition {
        // ---
        self.events.note_packet();
        self.metrics.packets_received_total.inc();
        self.metrics.bytes_received_total.inc_by(datagram.len() as u64);

        let view = match RtpView::parse(datagram) {
            Ok(view) => view,
            Err(e) => {
                self.stats.record_malformed();
                self.metrics.parse_errors_total.with_label_values(&[e.kind()]).inc();
                if self.stats.packets_malformed <= MAX_WARNINGS {
                    warn!("Dropping malformed RTP packet ({} bytes): {}", datagram.len(), e);
                }
                return RtpDisposition::Malformed(e);
            }
        };

        let header = view.header;
        let Some(ingested) = self.sync.ingest_rtp(
            header.ssrc,
            header.sequence,
            header.timestamp,
            view.payload.len(),
            from,
        ) else {
            return RtpDisposition::Untracked;
        };

        self.stats.record_packet(ingested.admission.seq);
        self.metrics
            .packets_lost_total
            .inc_by(u64::from(ingested.admission.seq.lost));

        if !ingested.admission.is_primary {
            self.stats.record_non_primary();
            self.metrics.non_primary_total.inc();
            return RtpDisposition::NonPrimary;
        }

        if view.payload.len() != self.chunk_bytes {
            self.stats.record_size_mismatch();
            self.metrics.size_mismatch_total.inc();
            if self.stats.size_mismatches <= MAX_WARNINGS {
                warn!(
                    "SSRC {:#010x}: payload of {} bytes, expected {}; dropped",
                    header.ssrc,
                    view.payload.len(),
                    self.chunk_bytes
                );
            }
            return RtpDisposition::SizeMismatch;
        }

        view.copy_payload_host(&mut self.scratch);

        let playout_us = match ingested.playout {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                debug!("SSRC {:#010x} seq {} unsynchronized: {}", header.ssrc, header.sequence, e);
                0
            }
            None => 0,
        };
        let synchronized = playout_us != 0;
        if !synchronized {
            self.stats.record_unsynchronized();
            self.metrics.unsynchronized_total.inc();
        }

        let mut buffer = self.buffer.lock();
        match buffer.push(header.ssrc, playout_us, ingested.arrival_us, &self.scratch) {
            PushOutcome::Stored => {}
            PushOutcome::Overwrote => self.metrics.buffer_overruns_total.inc(),
            PushOutcome::SizeMismatch => return RtpDisposition::SizeMismatch,
        }
        let status = buffer.status();
        drop(buffer);

        self.metrics.buffer_fill_chunks.set(status.size as i64);
        self.metrics.buffer_target_chunks.set(status.target_fill as i64);
        if status.underruns > self.last_underruns {
            self.metrics
                .buffer_underruns_total
                .inc_by(status.underruns - self.last_underruns);
            self.last_underruns = status.underruns;
        }

        RtpDisposition::Queued { synchronized }
    }

    /// Parses a compound RTCP datagram and applies SRs and BYEs.
    ///
    /// Returns the number of sub-packets handled.
    pub fn handle_rtcp(&mut self, datagram: &[u8], from: Option<SocketAddr>) -> usize {
        // ---
        self.events.note_packet();
        let packets = match parse_compound(datagram) {
            Ok(packets) => packets,
            Err(e) => {
                self.metrics.parse_errors_total.with_label_values(&[e.kind()]).inc();
                debug!("Dropping malformed RTCP packet ({} bytes): {}", datagram.len(), e);
                return 0;
            }
        };

        for packet in &packets {
            let label = match packet {
                RtcpPacket::SenderReport(sr) => {
                    if let Some(outcome) = self.sync.on_sender_report(sr, from) {
                        debug!("SR from SSRC {:#010x}: {:?}", sr.ssrc, outcome);
                    }
                    "sr"
                }
                RtcpPacket::ReceiverReport(_) => "rr",
                RtcpPacket::SourceDescription(_) => "sdes",
                RtcpPacket::Goodbye { ssrcs, reason } => {
                    if self.sync.on_bye(ssrcs) > 0 {
                        if let Some(reason) = reason {
                            info!("BYE reason: {}", reason);
                        }
                    }
                    "bye"
                }
                RtcpPacket::App { .. } => "app",
                RtcpPacket::Unknown(_) => "unknown",
            };
            self.metrics.rtcp_packets_total.with_label_values(&[label]).inc();
        }
        packets.len()
    }
}

/// Current multicast membership of the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    // ---
    pub group: Ipv4Addr,
    pub port: u16,
    pub ssrc_filter: Option<u32>,
}

/// Socket work needed to move from one target to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
    /// Already where we need to be.
    Keep,

    /// Leave any current group, then join this one.
    Join(Membership),

    /// Same group and port; only the preferred SSRC changes.
    UpdateFilter(Option<u32>),

    Leave,
}

/// Decides the socket work for a target change. Re-requesting the current
/// membership is a no-op.
pub fn plan_join(current: Option<&Membership>, target: &StreamTarget) -> JoinAction {
    // ---
    match (current, target) {
        (None, StreamTarget::Unicast) => JoinAction::Keep,
        (Some(_), StreamTarget::Unicast) => JoinAction::Leave,
        (Some(m), StreamTarget::Multicast { group, port, ssrc_filter }) if m.group == *group && m.port == *port => {
            if m.ssrc_filter == *ssrc_filter {
                JoinAction::Keep
            } else {
                JoinAction::UpdateFilter(*ssrc_filter)
            }
        }
        (_, StreamTarget::Multicast { group, port, ssrc_filter }) => JoinAction::Join(Membership {
            group: *group,
            port: *port,
            ssrc_filter: *ssrc_filter,
        }),
    }
}

/// RTP socket and its RTCP companion on `port + 1`.
struct SocketPair {
    // ---
    rtp: UdpSocket,
    rtcp: UdpSocket,
}

impl SocketPair {
    // ---
    fn unicast(port: u16) -> Result<Self> {
        // ---
        Ok(Self {
            rtp: bind_reusable(port).with_context(|| format!("failed to bind RTP port {}", port))?,
            rtcp: bind_reusable(port.wrapping_add(1))
                .with_context(|| format!("failed to bind RTCP port {}", port.wrapping_add(1)))?,
        })
    }

    fn multicast(group: Ipv4Addr, port: u16) -> Result<Self> {
        // ---
        Ok(Self {
            rtp: bind_multicast(group, port)?,
            rtcp: bind_multicast(group, port.wrapping_add(1))?,
        })
    }

    fn join(&self, group: Ipv4Addr) -> io::Result<()> {
        // ---
        self.rtp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        self.rtcp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
    }

    fn leave(&self, group: Ipv4Addr) -> io::Result<()> {
        // ---
        leave_multicast(&self.rtp, group)?;
        leave_multicast(&self.rtcp, group)
    }
}

/// A joined group. When the group shares the unicast port, the membership
/// is added to the unicast sockets instead of opening a second pair, so
/// each datagram is delivered once.
struct Joined {
    // ---
    membership: Membership,
    sockets: Option<SocketPair>,
}

enum IngressEvent {
    Shutdown,
    Target(Option<StreamTarget>),
    Config(Option<NodeConfig>),
    Rtp(io::Result<(usize, SocketAddr)>),
    Rtcp(io::Result<(usize, SocketAddr)>),
    MulticastRtp(io::Result<(usize, SocketAddr)>),
    MulticastRtcp(io::Result<(usize, SocketAddr)>),
}

/// Async receive loop owning every receive socket.
pub struct Ingress<P: ConfigProvider> {
    // ---
    dispatcher: RtpDispatcher,
    config: P,
    metrics: ReceiverMetrics,
    port: u16,
    unicast: SocketPair,
    joined: Option<Joined>,
    max_datagram: usize,
}

impl<P: ConfigProvider> Ingress<P> {
    // ---
    /// Binds the unicast sockets on the configured port.
    ///
    /// # Errors
    ///
    /// Returns error if either unicast socket cannot be bound.
    pub fn bind(dispatcher: RtpDispatcher, config: P, metrics: ReceiverMetrics) -> Result<Self> {
        // ---
        let cfg = config.current();
        let unicast = SocketPair::unicast(cfg.port)?;
        info!("Listening for RTP on port {} (RTCP on {})", cfg.port, cfg.port.wrapping_add(1));
        Ok(Self {
            dispatcher,
            config,
            metrics,
            port: cfg.port,
            unicast,
            joined: None,
            max_datagram: cfg.audio_format().max_datagram(),
        })
    }

    /// Local address of the unicast RTP socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        // ---
        self.unicast.rtp.local_addr()
    }

    pub fn membership(&self) -> Option<Membership> {
        // ---
        self.joined.as_ref().map(|j| j.membership)
    }

    /// Applies a target change. Socket failures leave the ingress on the
    /// unicast sockets.
    pub fn apply_target(&mut self, target: StreamTarget) {
        // ---
        match plan_join(self.membership().as_ref(), &target) {
            JoinAction::Keep => {}
            JoinAction::UpdateFilter(filter) => {
                if let Some(joined) = self.joined.as_mut() {
                    joined.membership.ssrc_filter = filter;
                }
                self.dispatcher.sync().set_preferred(filter);
            }
            JoinAction::Leave => {
                self.leave_current();
                self.dispatcher.sync().set_preferred(None);
            }
            JoinAction::Join(membership) => {
                self.leave_current();
                match self.join(membership) {
                    Ok(()) => {
                        self.metrics.multicast_joins_total.inc();
                        self.dispatcher.sync().set_preferred(membership.ssrc_filter);
                        info!(
                            "Joined multicast {}:{} (preferred SSRC {:?})",
                            membership.group, membership.port, membership.ssrc_filter
                        );
                    }
                    Err(e) => warn!("Multicast join {}:{} failed: {:#}", membership.group, membership.port, e),
                }
            }
        }
    }

    fn join(&mut self, membership: Membership) -> Result<()> {
        // ---
        let sockets = if membership.port == self.port {
            self.unicast
                .join(membership.group)
                .with_context(|| format!("failed to join multicast group {}", membership.group))?;
            None
        } else {
            Some(SocketPair::multicast(membership.group, membership.port)?)
        };
        self.joined = Some(Joined { membership, sockets });
        Ok(())
    }

    fn leave_current(&mut self) {
        // ---
        let Some(joined) = self.joined.take() else {
            return;
        };
        let group = joined.membership.group;
        let result = match &joined.sockets {
            Some(pair) => pair.leave(group),
            None => self.unicast.leave(group),
        };
        match result {
            Ok(()) => info!("Left multicast group {}", group),
            Err(e) => warn!("Leaving multicast group {} failed: {}", group, e),
        }
    }

    fn rebind(&mut self, port: u16) {
        // ---
        match SocketPair::unicast(port) {
            Ok(pair) => {
                let previous = self.joined.as_ref().map(|j| j.membership);
                self.leave_current();
                self.unicast = pair;
                self.port = port;
                info!("Rebound RTP to port {} (RTCP on {})", port, port.wrapping_add(1));
                if let Some(membership) = previous {
                    self.apply_target(StreamTarget::Multicast {
                        group: membership.group,
                        port: membership.port,
                        ssrc_filter: membership.ssrc_filter,
                    });
                }
            }
            Err(e) => warn!("Rebinding to port {} failed, staying on {}: {:#}", port, self.port, e),
        }
    }

    /// Runs until `shutdown` clears.
    ///
    /// # Arguments
    ///
    /// * `targets` - Stream target requests from session control
    /// * `shutdown` - Running flag
    pub async fn run(mut self, mut targets: watch::Receiver<StreamTarget>, shutdown: Shutdown) {
        // ---
        let mut config_rx = self.config.subscribe();
        let mut rtp_buf = vec![0u8; self.max_datagram];
        let mut rtcp_buf = vec![0u8; RTCP_BUFFER_SIZE];
        let mut mc_rtp_buf = vec![0u8; self.max_datagram];
        let mut mc_rtcp_buf = vec![0u8; RTCP_BUFFER_SIZE];
        let mut targets_open = true;
        let mut config_open = true;

        let initial = *targets.borrow_and_update();
        self.apply_target(initial);

        loop {
            let multicast = self.joined.as_ref().and_then(|j| j.sockets.as_ref());
            let event = tokio::select! {
                _ = shutdown.cancelled() => IngressEvent::Shutdown,
                t = watch_changed(&mut targets, targets_open) => IngressEvent::Target(t),
                c = watch_changed(&mut config_rx, config_open) => IngressEvent::Config(c),
                r = self.unicast.rtp.recv_from(&mut rtp_buf) => IngressEvent::Rtp(r),
                r = self.unicast.rtcp.recv_from(&mut rtcp_buf) => IngressEvent::Rtcp(r),
                r = recv_optional(multicast.map(|p| &p.rtp), &mut mc_rtp_buf) => IngressEvent::MulticastRtp(r),
                r = recv_optional(multicast.map(|p| &p.rtcp), &mut mc_rtcp_buf) => IngressEvent::MulticastRtcp(r),
            };

            match event {
                IngressEvent::Shutdown => break,
                IngressEvent::Target(Some(target)) => self.apply_target(target),
                IngressEvent::Target(None) => targets_open = false,
                IngressEvent::Config(Some(cfg)) => {
                    if cfg.port != self.port {
                        self.rebind(cfg.port);
                    }
                }
                IngressEvent::Config(None) => config_open = false,
                IngressEvent::Rtp(r) => self.on_datagram(r, &rtp_buf, false),
                IngressEvent::Rtcp(r) => self.on_datagram(r, &rtcp_buf, true),
                IngressEvent::MulticastRtp(r) => self.on_datagram(r, &mc_rtp_buf, false),
                IngressEvent::MulticastRtcp(r) => self.on_datagram(r, &mc_rtcp_buf, true),
            }
        }

        self.leave_current();
        self.dispatcher.stats().log();
        info!("Ingress stopped");
    }

    fn on_datagram(&mut self, result: io::Result<(usize, SocketAddr)>, buf: &[u8], rtcp: bool) {
        // ---
        match result {
            Ok((len, from)) if rtcp => {
                self.dispatcher.handle_rtcp(&buf[..len], Some(from));
            }
            Ok((len, from)) => {
                self.dispatcher.handle_rtp(&buf[..len], Some(from));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => warn!("UDP receive failed: {}", e),
        }
    }
}

/// Waits for the next value, or forever once the channel has closed.
async fn watch_changed<T: Clone>(rx: &mut watch::Receiver<T>, open: bool) -> Option<T> {
    // ---
    if !open {
        pending::<()>().await;
    }
    match rx.changed().await {
        Ok(()) => Some(rx.borrow_and_update().clone()),
        Err(_) => None,
    }
}

/// Receives on `socket`, or never resolves when there is none.
async fn recv_optional(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    // ---
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => pending().await,
    }
}
