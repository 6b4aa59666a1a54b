//! RTP fixed-header parsing (RFC 3550)
//!
//! The relay only needs the fields that drive QoS accounting; CSRC lists
//! and header extensions are tolerated and the payload is forwarded
//! verbatim, so nothing past the first 12 bytes is interpreted.

use bytes::{Buf, BufMut, BytesMut};

/// Minimum RTP packet size: the fixed header.
pub const RTP_HEADER_LEN: usize = 12;

/// The RTP fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (2 on anything modern)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (codec identifier)
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Media timestamp in codec clock units
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header from a datagram. Returns `None` for
    /// anything shorter than 12 bytes.
    pub fn parse(data: &[u8]) -> Option<RtpHeader> {
        if data.len() < RTP_HEADER_LEN {
            return None;
        }

        let mut buf = data;
        let byte0 = buf.get_u8();
        let byte1 = buf.get_u8();

        Some(RtpHeader {
            version: (byte0 >> 6) & 0x03,
            padding: byte0 & 0x20 != 0,
            extension: byte0 & 0x10 != 0,
            csrc_count: byte0 & 0x0F,
            marker: byte1 & 0x80 != 0,
            payload_type: byte1 & 0x7F,
            sequence: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        })
    }

    /// Serialize a packet with this header and the given payload.
    ///
    /// The relay never rewrites packets; this exists for senders (test
    /// endpoints, tone playback) that need well-formed RTP.
    pub fn build_packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        buf.put_u8(
            (self.version << 6)
                | ((self.padding as u8) << 5)
                | ((self.extension as u8) << 4)
                | (self.csrc_count & 0x0F),
        );
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(payload);
        buf.to_vec()
    }
}

impl Default for RtpHeader {
    fn default() -> Self {
        RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 0,
            sequence: 0,
            timestamp: 0,
            ssrc: 0x1234_5678,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_fields() {
        let header = RtpHeader {
            payload_type: 101,
            marker: true,
            sequence: 4242,
            timestamp: 160_000,
            ssrc: 0xDEAD_BEEF,
            ..Default::default()
        };
        let packet = header.build_packet(&[0xAB; 160]);
        assert_eq!(packet.len(), RTP_HEADER_LEN + 160);

        let parsed = RtpHeader::parse(&packet).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn short_datagrams_are_rejected() {
        assert!(RtpHeader::parse(&[]).is_none());
        assert!(RtpHeader::parse(&[0x80; 11]).is_none());
        assert!(RtpHeader::parse(&[0x80; 12]).is_some());
    }
}
