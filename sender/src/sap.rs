//! SAP announcements of the outgoing stream.
//!
//! The emitter re-renders the SDP from the active configuration on every
//! cycle, so destination and name changes show up in the next
//! announcement without a restart.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use scream_rtp_common::audio::CHANNELS;
use scream_rtp_common::net::bind_sender;
use scream_rtp_common::sap::{encode_sap, render_sdp, SdpParams, SAP_MAX_PACKET, SAP_TTL};
use scream_rtp_common::{ConfigProvider, NetworkInfo, NodeConfig, SenderMetrics, Shutdown};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::AnnounceError;

/// Interval between announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Retry delay after a failed announcement.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Builds the SAP packet announcing this sender's stream.
///
/// The SSRC doubles as SDP session id and, truncated to 16 bits, as the
/// SAP message id hash.
///
/// # Errors
///
/// Returns `AnnounceError::TooLarge` if the packet exceeds the SAP limit,
/// which only happens with very long device names.
pub fn build_announcement(cfg: &NodeConfig, ssrc: u32, origin: Ipv4Addr) -> Result<Vec<u8>, AnnounceError> {
    // ---
    let ptime_ms = ((cfg.audio_format().packet_duration_us() + 500) / 1000).max(1) as u32;
    let sdp = render_sdp(&SdpParams {
        session_id: ssrc,
        origin,
        stream_name: &cfg.device_name,
        device_name: &cfg.device_name,
        destination: cfg.sender_destination_ip,
        port: cfg.sender_destination_port,
        sample_rate: cfg.sample_rate,
        channels: CHANNELS,
        ptime_ms,
    });

    let packet = encode_sap(ssrc as u16, origin, &sdp);
    if packet.len() > SAP_MAX_PACKET {
        return Err(AnnounceError::TooLarge(packet.len(), SAP_MAX_PACKET));
    }
    Ok(packet)
}

/// Announces the stream until `shutdown` clears.
///
/// # Errors
///
/// Returns error if the announcement socket cannot be created.
pub async fn run_sap_emitter<P: ConfigProvider>(
    config: P,
    network: watch::Receiver<NetworkInfo>,
    ssrc: u32,
    metrics: SenderMetrics,
    shutdown: Shutdown,
) -> Result<()> {
    // ---
    let socket = bind_sender(SAP_TTL)?;
    let mut sent: u64 = 0;

    loop {
        let cfg = config.current();
        let origin = network.borrow().primary();

        let delay = match build_announcement(&cfg, ssrc, origin) {
            Ok(packet) => match socket.send_to(&packet, SocketAddr::V4(cfg.sap_address)).await {
                Ok(_) => {
                    sent += 1;
                    metrics.sap_announcements_sent_total.inc();
                    if sent == 1 {
                        info!(
                            "Announcing {:?} ({}:{}) on {}",
                            cfg.device_name, cfg.sender_destination_ip, cfg.sender_destination_port, cfg.sap_address
                        );
                    } else {
                        debug!("SAP announcement {} sent ({} bytes)", sent, packet.len());
                    }
                    ANNOUNCE_INTERVAL
                }
                Err(e) => {
                    warn!("Failed to send SAP announcement to {}: {}", cfg.sap_address, e);
                    RETRY_INTERVAL
                }
            },
            Err(e) => {
                warn!("Cannot announce stream: {}", e);
                RETRY_INTERVAL
            }
        };

        if !shutdown.sleep(delay).await {
            break;
        }
    }

    info!("SAP emitter stopped after {} announcements", sent);
    Ok(())
}
