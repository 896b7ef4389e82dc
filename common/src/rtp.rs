//! RTP packet parsing and serialization (RFC 3550, L16 payload per RFC 3551).
//!
//! The parser is zero-copy: it validates the fixed header, skips CSRCs and
//! the header extension, strips padding, and hands back a view of the
//! payload. Samples stay big-endian on the wire; `RtpView::copy_payload_host`
//! performs the mandatory L16 byte swap into little-endian chunk storage.

use crate::audio::copy_swap16;
use crate::error::ParseError;

/// RTP version (RFC 3550).
pub const RTP_VERSION: u8 = 2;

/// Fixed header size in bytes.
pub const RTP_HEADER_SIZE: usize = 12;

/// Dynamic payload type announced as `L16/<rate>/2`.
pub const PAYLOAD_TYPE_L16: u8 = 127;

/// Fixed RTP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    // ---
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    // ---
    /// Header for an L16 packet with no marker.
    pub fn l16(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        // ---
        Self {
            marker: false,
            payload_type: PAYLOAD_TYPE_L16,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Encodes the 12-byte fixed header.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// ```
    ///
    /// Padding, extension and CSRCs are never emitted.
    pub fn encode(&self) -> [u8; RTP_HEADER_SIZE] {
        // ---
        let mut buf = [0u8; RTP_HEADER_SIZE];
        buf[0] = RTP_VERSION << 6;
        buf[1] = (u8::from(self.marker) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }
}

/// A validated RTP datagram borrowed from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct RtpView<'a> {
    // ---
    pub header: RtpHeader,
    pub csrc_count: u8,
    pub has_extension: bool,

    /// Payload in wire (big-endian) order, padding removed.
    pub payload: &'a [u8],
}

impl<'a> RtpView<'a> {
    // ---
    /// Parses and validates a raw datagram.
    ///
    /// # Errors
    ///
    /// - `TooShort` if the fixed header or the CSRC list does not fit
    /// - `BadVersion` if the version field is not 2
    /// - `BadExtension` if the extension header runs out of bounds
    /// - `BadSize` if the padding count exceeds the remaining payload,
    ///   or no payload is left
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        // ---
        if data.len() < RTP_HEADER_SIZE {
            return Err(ParseError::TooShort);
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(ParseError::BadVersion);
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = data[0] & 0x0F;

        let mut header_size = RTP_HEADER_SIZE + 4 * csrc_count as usize;
        if data.len() < header_size {
            return Err(ParseError::TooShort);
        }

        if has_extension {
            if data.len() < header_size + 4 {
                return Err(ParseError::BadExtension);
            }
            let ext_words =
                u16::from_be_bytes([data[header_size + 2], data[header_size + 3]]) as usize;
            header_size += 4 + 4 * ext_words;
            if data.len() < header_size {
                return Err(ParseError::BadExtension);
            }
        }

        let mut payload_end = data.len();
        if has_padding {
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || pad > payload_end - header_size {
                return Err(ParseError::BadSize);
            }
            payload_end -= pad;
        }

        if payload_end == header_size {
            return Err(ParseError::BadSize);
        }

        let header = RtpHeader {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };

        Ok(Self {
            header,
            csrc_count,
            has_extension,
            payload: &data[header_size..payload_end],
        })
    }

    /// Copies the payload into `dst` converting samples to little-endian.
    ///
    /// Returns the number of bytes written.
    pub fn copy_payload_host(&self, dst: &mut [u8]) -> usize {
        // ---
        let len = self.payload.len().min(dst.len());
        copy_swap16(&self.payload[..len], &mut dst[..len]);
        len
    }
}

/// Serializes an L16 packet into `out`, converting little-endian samples
/// in `pcm_le` to network order.
///
/// `out` is cleared first so the caller can reuse its allocation.
pub fn write_l16_packet(header: &RtpHeader, pcm_le: &[u8], out: &mut Vec<u8>) {
    // ---
    out.clear();
    out.extend_from_slice(&header.encode());
    let start = out.len();
    out.resize(start + pcm_le.len(), 0);
    copy_swap16(pcm_le, &mut out[start..]);
}
