//! RTCP wire format (RFC 3550 section 6).
//!
//! Parses compound packets into typed reports and builds the SR, RR,
//! SDES and BYE packets both pipelines emit. Timing math (jitter, LSR/DLSR,
//! the clock map) lives with the state that owns it, not here.

use crate::error::ParseError;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;

const SDES_END: u8 = 0;
const SDES_CNAME: u8 = 1;
const REPORT_BLOCK_SIZE: usize = 24;

/// 64-bit NTP timestamp split into seconds and fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    // ---
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    // ---
    /// Converts Unix-epoch microseconds to NTP format.
    pub fn from_unix_us(unix_us: i64) -> Self {
        // ---
        let unix_us = unix_us.max(0) as u64;
        let seconds = unix_us / 1_000_000 + NTP_EPOCH_OFFSET;
        let micros = unix_us % 1_000_000;
        let fraction = (micros << 32) / 1_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    /// Converts to Unix-epoch microseconds: `(sec − 2208988800)·1e6 + frac·1e6/2³²`.
    pub fn to_unix_us(self) -> i64 {
        // ---
        let secs = self.seconds as i64 - NTP_EPOCH_OFFSET as i64;
        let micros = ((self.fraction as u64 * 1_000_000) >> 32) as i64;
        secs * 1_000_000 + micros
    }

    /// Middle 32 bits, as carried in the LSR field.
    pub fn middle32(self) -> u32 {
        // ---
        (self.seconds << 16) | (self.fraction >> 16)
    }

    pub fn is_zero(self) -> bool {
        // ---
        self.seconds == 0 && self.fraction == 0
    }
}

/// One reception report block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportBlock {
    // ---
    pub ssrc: u32,
    pub fraction_lost: u8,

    /// Signed 24-bit cumulative loss; clamped on encode.
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    // ---
    fn encode(&self, out: &mut Vec<u8>) {
        // ---
        let lost = self.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF) as u32 & 0x00FF_FFFF;
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.push(self.fraction_lost);
        out.extend_from_slice(&lost.to_be_bytes()[1..]);
        out.extend_from_slice(&self.extended_highest_seq.to_be_bytes());
        out.extend_from_slice(&self.jitter.to_be_bytes());
        out.extend_from_slice(&self.last_sr.to_be_bytes());
        out.extend_from_slice(&self.delay_since_last_sr.to_be_bytes());
    }

    fn decode(b: &[u8]) -> Self {
        // ---
        let raw_lost = u32::from_be_bytes([0, b[5], b[6], b[7]]);
        // Sign-extend the 24-bit field.
        let cumulative_lost = ((raw_lost << 8) as i32) >> 8;
        Self {
            ssrc: be32(&b[0..4]),
            fraction_lost: b[4],
            cumulative_lost,
            extended_highest_seq: be32(&b[8..12]),
            jitter: be32(&b[12..16]),
            last_sr: be32(&b[16..20]),
            delay_since_last_sr: be32(&b[20..24]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    // ---
    pub ssrc: u32,
    pub ntp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    // ---
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

/// One SDES chunk; only CNAME is retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    // ---
    pub ssrc: u32,
    pub cname: Option<String>,
}

/// A parsed sub-packet of a compound RTCP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Goodbye { ssrcs: Vec<u32>, reason: Option<String> },
    App { subtype: u8, ssrc: u32, name: [u8; 4] },
    Unknown(u8),
}

/// Parses a compound RTCP datagram.
///
/// Every sub-packet must carry version 2 and a length that fits the
/// datagram; one bad sub-packet rejects the whole datagram.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>, ParseError> {
    // ---
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let mut packets = Vec::with_capacity(2);
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < 4 {
            return Err(ParseError::TooShort);
        }
        if rest[0] >> 6 != 2 {
            return Err(ParseError::BadVersion);
        }

        let count = (rest[0] & 0x1F) as usize;
        let padded = rest[0] & 0x20 != 0;
        let pt = rest[1];
        let size = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if size > rest.len() {
            return Err(ParseError::BadSize);
        }

        let mut body = &rest[4..size];
        if padded {
            let pad = *body.last().ok_or(ParseError::BadSize)? as usize;
            if pad > body.len() {
                return Err(ParseError::BadSize);
            }
            body = &body[..body.len() - pad];
        }

        packets.push(parse_one(pt, count, body)?);
        offset += size;
    }

    Ok(packets)
}

fn parse_one(pt: u8, count: usize, body: &[u8]) -> Result<RtcpPacket, ParseError> {
    // ---
    match pt {
        PT_SR => {
            if body.len() < 24 + count * REPORT_BLOCK_SIZE {
                return Err(ParseError::BadSize);
            }
            Ok(RtcpPacket::SenderReport(SenderReport {
                ssrc: be32(&body[0..4]),
                ntp: NtpTimestamp {
                    seconds: be32(&body[4..8]),
                    fraction: be32(&body[8..12]),
                },
                rtp_timestamp: be32(&body[12..16]),
                packet_count: be32(&body[16..20]),
                octet_count: be32(&body[20..24]),
                reports: report_blocks(&body[24..], count),
            }))
        }
        PT_RR => {
            if body.len() < 4 + count * REPORT_BLOCK_SIZE {
                return Err(ParseError::BadSize);
            }
            Ok(RtcpPacket::ReceiverReport(ReceiverReport {
                ssrc: be32(&body[0..4]),
                reports: report_blocks(&body[4..], count),
            }))
        }
        PT_SDES => Ok(RtcpPacket::SourceDescription(parse_sdes(body, count)?)),
        PT_BYE => {
            if body.len() < count * 4 {
                return Err(ParseError::BadSize);
            }
            let ssrcs = body[..count * 4].chunks_exact(4).map(be32).collect();
            let reason = body.get(count * 4).and_then(|&len| {
                body.get(count * 4 + 1..count * 4 + 1 + len as usize)
                    .map(|r| String::from_utf8_lossy(r).into_owned())
            });
            Ok(RtcpPacket::Goodbye { ssrcs, reason })
        }
        PT_APP => {
            if body.len() < 8 {
                return Err(ParseError::BadSize);
            }
            Ok(RtcpPacket::App {
                subtype: count as u8,
                ssrc: be32(&body[0..4]),
                name: [body[4], body[5], body[6], body[7]],
            })
        }
        other => Ok(RtcpPacket::Unknown(other)),
    }
}

fn report_blocks(body: &[u8], count: usize) -> Vec<ReportBlock> {
    // ---
    body.chunks_exact(REPORT_BLOCK_SIZE)
        .take(count)
        .map(ReportBlock::decode)
        .collect()
}

fn parse_sdes(body: &[u8], count: usize) -> Result<Vec<SdesChunk>, ParseError> {
    // ---
    let mut chunks = Vec::with_capacity(count);
    let mut pos = 0;

    for _ in 0..count {
        if body.len() < pos + 4 {
            return Err(ParseError::BadSize);
        }
        let ssrc = be32(&body[pos..pos + 4]);
        pos += 4;

        let mut cname = None;
        loop {
            let item = *body.get(pos).ok_or(ParseError::BadSize)?;
            if item == SDES_END {
                pos += 1;
                break;
            }
            let len = *body.get(pos + 1).ok_or(ParseError::BadSize)? as usize;
            let text = body.get(pos + 2..pos + 2 + len).ok_or(ParseError::BadSize)?;
            if item == SDES_CNAME {
                cname = Some(String::from_utf8_lossy(text).into_owned());
            }
            pos += 2 + len;
        }
        // Chunks are padded to a word boundary.
        pos = (pos + 3) & !3;
        chunks.push(SdesChunk { ssrc, cname });
    }

    Ok(chunks)
}

fn be32(b: &[u8]) -> u32 {
    // ---
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn begin(out: &mut Vec<u8>, count: u8, pt: u8) -> usize {
    // ---
    let start = out.len();
    out.push(0x80 | (count & 0x1F));
    out.push(pt);
    out.extend_from_slice(&[0, 0]);
    start
}

fn finish(out: &mut [u8], start: usize) {
    // ---
    let words = ((out.len() - start) / 4 - 1) as u16;
    out[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
}

impl SenderReport {
    // ---
    /// Appends this SR to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        // ---
        let start = begin(out, self.reports.len() as u8, PT_SR);
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.ntp.seconds.to_be_bytes());
        out.extend_from_slice(&self.ntp.fraction.to_be_bytes());
        out.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        out.extend_from_slice(&self.packet_count.to_be_bytes());
        out.extend_from_slice(&self.octet_count.to_be_bytes());
        for block in self.reports.iter().take(31) {
            block.encode(out);
        }
        finish(out, start);
    }
}

impl ReceiverReport {
    // ---
    /// Appends this RR to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        // ---
        let start = begin(out, self.reports.len() as u8, PT_RR);
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for block in self.reports.iter().take(31) {
            block.encode(out);
        }
        finish(out, start);
    }
}

/// Appends an SDES packet with a single CNAME chunk.
pub fn encode_sdes_cname(ssrc: u32, cname: &str, out: &mut Vec<u8>) {
    // ---
    let start = begin(out, 1, PT_SDES);
    let name = &cname.as_bytes()[..cname.len().min(255)];
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.push(SDES_CNAME);
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    out.push(SDES_END);
    while (out.len() - start) % 4 != 0 {
        out.push(0);
    }
    finish(out, start);
}

/// Appends a BYE packet for `ssrcs`.
pub fn encode_bye(ssrcs: &[u32], out: &mut Vec<u8>) {
    // ---
    let start = begin(out, ssrcs.len().min(31) as u8, PT_BYE);
    for ssrc in ssrcs.iter().take(31) {
        out.extend_from_slice(&ssrc.to_be_bytes());
    }
    finish(out, start);
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_ntp_conversion() {
        // ---
        let ntp = NtpTimestamp {
            seconds: (NTP_EPOCH_OFFSET + 10) as u32,
            fraction: 1 << 31,
        };
        assert_eq!(ntp.to_unix_us(), 10_500_000);
        assert_eq!(NtpTimestamp::from_unix_us(10_500_000), ntp);
        assert_eq!(ntp.middle32(), ((ntp.seconds & 0xFFFF) << 16) | 0x8000);
    }

    #[test]
    fn test_sender_report_with_sdes_parses() {
        // ---
        let sr = SenderReport {
            ssrc: 0xCAFE_F00D,
            ntp: NtpTimestamp::from_unix_us(1_700_000_000_000_000),
            rtp_timestamp: 288_000,
            packet_count: 1000,
            octet_count: 1_152_000,
            reports: vec![],
        };
        let mut buf = Vec::new();
        sr.encode(&mut buf);
        encode_sdes_cname(sr.ssrc, "scream@host", &mut buf);

        let packets = parse_compound(&buf).expect("parse failed");
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], RtcpPacket::SenderReport(sr));
        match &packets[1] {
            RtcpPacket::SourceDescription(chunks) => {
                assert_eq!(chunks[0].cname.as_deref(), Some("scream@host"));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_receiver_report_block_round_trip() {
        // ---
        let rr = ReceiverReport {
            ssrc: 7,
            reports: vec![ReportBlock {
                ssrc: 9,
                fraction_lost: 25,
                cumulative_lost: -3,
                extended_highest_seq: 0x1_0001,
                jitter: 42,
                last_sr: 0x1234_5678,
                delay_since_last_sr: 65536,
            }],
        };
        let mut buf = Vec::new();
        rr.encode(&mut buf);
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], PT_RR);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]) as usize, buf.len() / 4 - 1);

        let packets = parse_compound(&buf).expect("parse failed");
        assert_eq!(packets, vec![RtcpPacket::ReceiverReport(rr)]);
    }

    #[test]
    fn test_bye_and_bounds() {
        // ---
        let mut buf = Vec::new();
        encode_bye(&[1, 2], &mut buf);
        let packets = parse_compound(&buf).expect("parse failed");
        assert_eq!(
            packets,
            vec![RtcpPacket::Goodbye {
                ssrcs: vec![1, 2],
                reason: None
            }]
        );

        buf[3] += 1;
        assert_eq!(parse_compound(&buf).unwrap_err(), ParseError::BadSize);

        buf[3] -= 1;
        buf[0] = 0x42;
        assert_eq!(parse_compound(&buf).unwrap_err(), ParseError::BadVersion);

        assert_eq!(parse_compound(&[0x80, 200]).unwrap_err(), ParseError::TooShort);
    }

    #[test]
    fn test_app_and_unknown_are_tolerated() {
        // ---
        let buf = [
            0x81, PT_APP, 0, 2, 0, 0, 0, 5, b'T', b'E', b'S', b'T', // APP
            0x80, 199, 0, 0, // unknown type, empty body
        ];
        let packets = parse_compound(&buf).expect("parse failed");
        assert_eq!(
            packets[0],
            RtcpPacket::App {
                subtype: 1,
                ssrc: 5,
                name: *b"TEST"
            }
        );
        assert_eq!(packets[1], RtcpPacket::Unknown(199));
    }
}
