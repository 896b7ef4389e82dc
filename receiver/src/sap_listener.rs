//! SAP listener: turns announcements into stream descriptions.
//!
//! Stateless per packet. Duplicate suppression and matching against the
//! configured stream name happen in session control.

use std::io;
use std::net::{IpAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Result;
use scream_rtp_common::net::bind_multicast;
use scream_rtp_common::sap::{parse_sap, parse_stream_description, StreamDescription, SDP_MIME};
use scream_rtp_common::{ReceiverMetrics, Shutdown};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Largest SAP datagram accepted.
const SAP_RECV_BUFFER: usize = 2048;

/// Pause after a failed receive before reading the socket again.
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// A stream description and the host that announced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SapAnnouncement {
    // ---
    pub description: StreamDescription,
    pub origin: IpAddr,
}

/// Extracts the announced stream from a SAP datagram.
///
/// Returns `None` for deletions, non-SDP payloads and anything that does
/// not parse; the reason is logged at debug level.
pub fn decode_announcement(datagram: &[u8]) -> Option<SapAnnouncement> {
    // ---
    let msg = match parse_sap(datagram) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Ignoring SAP packet ({} bytes): {}", datagram.len(), e);
            return None;
        }
    };

    if msg.deletion {
        debug!("Ignoring SAP deletion from {}", msg.origin);
        return None;
    }
    if let Some(mime) = msg.payload_type {
        if mime != SDP_MIME {
            debug!("Ignoring SAP payload type {:?}", mime);
            return None;
        }
    }

    match parse_stream_description(msg.payload) {
        Ok(description) => Some(SapAnnouncement {
            description,
            origin: msg.origin,
        }),
        Err(e) => {
            debug!("Ignoring SDP from {}: {}", msg.origin, e);
            None
        }
    }
}

/// Logs a receive failure and waits out the backoff.
///
/// Returns false if shutdown was requested while waiting.
async fn back_off_after_error(err: &io::Error, shutdown: &Shutdown) -> bool {
    // ---
    debug!("SAP receive failed: {}", err);
    shutdown.sleep(RECV_ERROR_BACKOFF).await
}

/// Listens on the SAP group and forwards decoded announcements.
///
/// # Errors
///
/// Returns error if the SAP socket cannot be bound or joined.
pub async fn run_sap_listener(
    addr: SocketAddrV4,
    tx: mpsc::Sender<SapAnnouncement>,
    metrics: ReceiverMetrics,
    shutdown: Shutdown,
) -> Result<()> {
    // ---
    let socket = bind_multicast(*addr.ip(), addr.port())?;
    info!("Listening for SAP announcements on {}", addr);
    let mut buf = vec![0u8; SAP_RECV_BUFFER];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                if !back_off_after_error(&e, &shutdown).await {
                    break;
                }
                continue;
            }
        };

        let Some(announcement) = decode_announcement(&buf[..len]) else {
            continue;
        };
        metrics.sap_announcements_total.inc();
        debug!(
            "SAP from {}: {:?} -> {}:{} @ {} Hz",
            from,
            announcement.description.name,
            announcement.description.destination,
            announcement.description.port,
            announcement.description.sample_rate
        );
        if tx.send(announcement).await.is_err() {
            break;
        }
    }

    debug!("SAP listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use scream_rtp_common::sap::{encode_sap, render_sdp, SdpParams};
    use std::net::Ipv4Addr;

    fn announcement_bytes(name: &str) -> Vec<u8> {
        // ---
        let sdp = render_sdp(&SdpParams {
            session_id: 0xBEEF,
            origin: Ipv4Addr::new(192, 168, 1, 20),
            stream_name: name,
            device_name: "test",
            destination: Ipv4Addr::new(239, 255, 77, 77),
            port: 4010,
            sample_rate: 48_000,
            channels: 2,
            ptime_ms: 6,
        });
        encode_sap(0xBEEF, Ipv4Addr::new(192, 168, 1, 20), &sdp)
    }

    #[test]
    fn test_decode_announcement() {
        // ---
        let a = decode_announcement(&announcement_bytes("foo")).expect("decode failed");
        assert_eq!(a.description.name, "foo");
        assert_eq!(a.description.destination, Ipv4Addr::new(239, 255, 77, 77));
        assert_eq!(a.description.port, 4010);
        assert_eq!(a.description.sample_rate, 48_000);
        assert_eq!(a.origin, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[tokio::test]
    async fn test_receive_error_backs_off() {
        // ---
        let shutdown = Shutdown::new();
        let err = io::Error::new(io::ErrorKind::Other, "socket gone");

        let started = std::time::Instant::now();
        assert!(back_off_after_error(&err, &shutdown).await);
        assert!(started.elapsed() >= RECV_ERROR_BACKOFF);

        shutdown.trigger();
        let started = std::time::Instant::now();
        assert!(!back_off_after_error(&err, &shutdown).await);
        assert!(started.elapsed() < RECV_ERROR_BACKOFF);
    }

    #[test]
    fn test_deletion_and_garbage_ignored() {
        // ---
        let mut deletion = announcement_bytes("foo");
        deletion[0] |= 0x04;
        assert!(decode_announcement(&deletion).is_none());
        assert!(decode_announcement(&[0x20, 0, 0]).is_none());

        let mut other_mime = announcement_bytes("foo");
        other_mime[8..23].copy_from_slice(b"application/xyz");
        assert!(decode_announcement(&other_mime).is_none());
    }
}
