//! SAP (RFC 2974) framing and the SDP body describing an L16 stream.
//!
//! The emitter side renders a fixed-shape SDP and wraps it in an
//! uncompressed, unauthenticated SAP announcement. The listener side
//! accepts any SAP v1 announcement carrying `application/sdp` and pulls
//! out the handful of fields session control acts on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4};

use thiserror::Error;

use crate::audio::SUPPORTED_RATES;
use crate::error::ParseError;
use crate::rtp::PAYLOAD_TYPE_L16;

/// Well-known SAP multicast group for global-scope IPv4 sessions.
pub const SAP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 2, 127, 254);

pub const SAP_PORT: u16 = 9875;

/// Default SAP destination.
pub const SAP_DEFAULT_ADDR: SocketAddrV4 = SocketAddrV4::new(SAP_GROUP, SAP_PORT);

/// Multicast TTL used for SAP and multicast RTP.
pub const SAP_TTL: u32 = 15;

/// Upper bound on an emitted announcement.
pub const SAP_MAX_PACKET: usize = 600;

pub const SDP_MIME: &str = "application/sdp";

const SAP_FLAGS_V1_IPV4: u8 = 0x20;

/// A parsed SAP message borrowing from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SapMessage<'a> {
    // ---
    pub deletion: bool,
    pub msg_id_hash: u16,
    pub origin: IpAddr,
    pub payload_type: Option<&'a str>,
    pub payload: &'a str,
}

/// Parses a SAP datagram.
///
/// # Errors
///
/// - `TooShort` if the header, origin or authentication data is truncated
/// - `BadVersion` if the SAP version is not 1
/// - `BadSize` if the message is encrypted or compressed, or the payload is not UTF-8
pub fn parse_sap(data: &[u8]) -> Result<SapMessage<'_>, ParseError> {
    // ---
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let flags = data[0];
    if (flags >> 5) & 0x07 != 1 {
        return Err(ParseError::BadVersion);
    }
    let ipv6 = flags & 0x10 != 0;
    let deletion = flags & 0x04 != 0;
    if flags & 0x03 != 0 {
        // Encrypted or compressed payloads are not supported.
        return Err(ParseError::BadSize);
    }

    let auth_len = data[1] as usize * 4;
    let msg_id_hash = u16::from_be_bytes([data[2], data[3]]);
    let origin_len = if ipv6 { 16 } else { 4 };

    let mut pos = 4;
    let origin_bytes = data.get(pos..pos + origin_len).ok_or(ParseError::TooShort)?;
    let origin = if ipv6 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(origin_bytes);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        IpAddr::V4(Ipv4Addr::new(
            origin_bytes[0],
            origin_bytes[1],
            origin_bytes[2],
            origin_bytes[3],
        ))
    };
    pos += origin_len + auth_len;
    let rest = data.get(pos..).ok_or(ParseError::TooShort)?;

    // The payload type is optional; SDP bodies always begin with "v=".
    let (payload_type, body) = if rest.starts_with(b"v=") {
        (None, rest)
    } else {
        let nul = rest.iter().position(|&b| b == 0).ok_or(ParseError::BadSize)?;
        let mime = std::str::from_utf8(&rest[..nul]).map_err(|_| ParseError::BadSize)?;
        (Some(mime), &rest[nul + 1..])
    };

    let payload = std::str::from_utf8(body).map_err(|_| ParseError::BadSize)?;

    Ok(SapMessage {
        deletion,
        msg_id_hash,
        origin,
        payload_type,
        payload,
    })
}

/// Builds a SAP announcement: 8-byte header, MIME type, SDP body.
pub fn encode_sap(msg_id_hash: u16, origin: Ipv4Addr, sdp: &str) -> Vec<u8> {
    // ---
    let mut out = Vec::with_capacity(8 + SDP_MIME.len() + 1 + sdp.len());
    out.push(SAP_FLAGS_V1_IPV4);
    out.push(0);
    out.extend_from_slice(&msg_id_hash.to_be_bytes());
    out.extend_from_slice(&origin.octets());
    out.extend_from_slice(SDP_MIME.as_bytes());
    out.push(0);
    out.extend_from_slice(sdp.as_bytes());
    out
}

/// SDP fields that describe an announced L16 stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    // ---
    pub name: String,
    pub destination: Ipv4Addr,
    pub port: u16,

    /// 0 when the announcement carried no usable rtpmap.
    pub sample_rate: u32,
    pub channels: u16,
}

/// Inputs for rendering an announcement body.
#[derive(Debug, Clone)]
pub struct SdpParams<'a> {
    // ---
    pub session_id: u32,
    pub origin: Ipv4Addr,
    pub stream_name: &'a str,
    pub device_name: &'a str,
    pub destination: Ipv4Addr,
    pub port: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub ptime_ms: u32,
}

/// Renders the SDP body announced by the sender.
pub fn render_sdp(p: &SdpParams<'_>) -> String {
    // ---
    let khz = p.sample_rate as f64 / 1000.0;
    let c_line = if p.destination.is_multicast() {
        format!("{}/{}", p.destination, SAP_TTL)
    } else {
        p.destination.to_string()
    };
    format!(
        "v=0\r\n\
         o=- {id} {id} IN IP4 {origin}\r\n\
         s={name}\r\n\
         i={khz}kHz 16-bit Stereo Audio from {device}\r\n\
         c=IN IP4 {c_line}\r\n\
         t=0 0\r\n\
         a=recvonly\r\n\
         m=audio {port} RTP/AVP {pt}\r\n\
         a=rtpmap:{pt} L16/{rate}/{channels}\r\n\
         a=ptime:{ptime}\r\n",
        id = p.session_id,
        origin = p.origin,
        name = p.stream_name,
        device = p.device_name,
        port = p.port,
        pt = PAYLOAD_TYPE_L16,
        rate = p.sample_rate,
        channels = p.channels,
        ptime = p.ptime_ms,
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    // ---
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid connection line: {0}")]
    InvalidConnection(String),

    #[error("invalid media line: {0}")]
    InvalidMedia(String),
}

/// Extracts the stream description from an SDP body.
///
/// The rtpmap search is scoped to the audio media section; an rtpmap for
/// any payload type with encoding `L16` is accepted when its rate is one
/// of the supported rates.
pub fn parse_stream_description(sdp: &str) -> Result<StreamDescription, SdpError> {
    // ---
    let mut name = None;
    let mut destination = None;
    let mut port = None;
    let mut audio_pt: Option<String> = None;
    let mut in_audio = false;
    let mut sample_rate = 0;
    let mut channels = 2;

    for line in sdp.lines() {
        let line = line.trim();
        if line.len() < 2 || line.as_bytes()[1] != b'=' {
            continue;
        }
        let value = &line[2..];

        match line.as_bytes()[0] {
            b's' if name.is_none() => name = Some(value.trim().to_string()),
            b'c' => {
                let addr = value
                    .strip_prefix("IN IP4 ")
                    .ok_or_else(|| SdpError::InvalidConnection(value.to_string()))?;
                let addr = addr.split('/').next().unwrap_or(addr).trim();
                let ip = addr
                    .parse::<Ipv4Addr>()
                    .map_err(|_| SdpError::InvalidConnection(value.to_string()))?;
                destination = Some(ip);
            }
            b'm' => {
                let mut fields = value.split_whitespace();
                in_audio = fields.next() == Some("audio");
                if in_audio {
                    let p = fields
                        .next()
                        .and_then(|p| p.split('/').next())
                        .and_then(|p| p.parse::<u16>().ok())
                        .ok_or_else(|| SdpError::InvalidMedia(value.to_string()))?;
                    port = Some(p);
                    // fields: proto, then the first format
                    audio_pt = fields.nth(1).map(str::to_string);
                }
            }
            b'a' if in_audio => {
                if let Some((rate, ch)) = parse_rtpmap(value, audio_pt.as_deref()) {
                    sample_rate = rate;
                    channels = ch;
                }
            }
            _ => {}
        }
    }

    Ok(StreamDescription {
        name: name.ok_or(SdpError::MissingField("s="))?,
        destination: destination.ok_or(SdpError::MissingField("c="))?,
        port: port.ok_or(SdpError::MissingField("m=audio"))?,
        sample_rate,
        channels,
    })
}

/// Parses `rtpmap:<pt> L16/<rate>[/<channels>]`.
fn parse_rtpmap(attr: &str, audio_pt: Option<&str>) -> Option<(u32, u16)> {
    // ---
    let rest = attr.strip_prefix("rtpmap:")?;
    let (pt, encoding) = rest.split_once(' ')?;
    if let Some(expected) = audio_pt {
        if pt != expected {
            return None;
        }
    }

    let mut parts = encoding.trim().split('/');
    if !parts.next()?.eq_ignore_ascii_case("L16") {
        return None;
    }
    let rate: u32 = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok()).unwrap_or(1);
    SUPPORTED_RATES.contains(&rate).then_some((rate, channels))
}
