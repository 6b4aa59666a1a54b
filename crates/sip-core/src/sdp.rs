//! Minimal SDP codec for audio sessions (RFC 4566)
//!
//! Parsing collects exactly what the relay needs: the connection address,
//! the audio media port and the payload-type list. Building emits an
//! audio offer listing codecs in preference order with their rtpmap (and
//! fmtp where needed) attributes.

use crate::error::{Error, Result};

/// Static payload types per the IANA RTP/AVP assignments, plus the
/// conventional dynamic type for iLBC.
pub const PT_PCMU: u8 = 0;
pub const PT_G726_32: u8 = 2;
pub const PT_GSM: u8 = 3;
pub const PT_G723: u8 = 4;
pub const PT_PCMA: u8 = 8;
pub const PT_G722: u8 = 9;
pub const PT_G729: u8 = 18;
pub const PT_ILBC: u8 = 97;

/// rtpmap name and clock rate for a payload type.
///
/// G.722's RTP clock rate is 8000 despite the 16 kHz sampling rate; that
/// mismatch is part of the RFC 3551 assignment.
fn rtpmap_entry(payload_type: u8) -> Option<(&'static str, u32)> {
    match payload_type {
        PT_PCMU => Some(("PCMU", 8000)),
        PT_G726_32 => Some(("G726-32", 8000)),
        PT_GSM => Some(("GSM", 8000)),
        PT_G723 => Some(("G723", 8000)),
        PT_PCMA => Some(("PCMA", 8000)),
        PT_G722 => Some(("G722", 8000)),
        PT_G729 => Some(("G729", 8000)),
        PT_ILBC => Some(("iLBC", 8000)),
        _ => None,
    }
}

/// Audio media description extracted from an SDP body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    /// Connection address from the `c=` line
    pub address: String,
    /// Audio port from the `m=audio` line
    pub port: u16,
    /// Payload types in the order offered
    pub formats: Vec<u8>,
}

/// A parsed SDP session, audio subset only
#[derive(Debug, Clone, Default)]
pub struct SdpSession {
    /// Address from `c=IN IP4 <ip>`
    pub connection_address: Option<String>,
    /// Port from `m=audio <port> RTP/AVP ...`
    pub audio_port: Option<u16>,
    /// Payload types from the media line
    pub formats: Vec<u8>,
    /// rtpmap attributes, as (payload type, encoding) pairs
    pub rtpmaps: Vec<(u8, String)>,
}

impl SdpSession {
    /// Parse an SDP body. Unknown lines are skipped; the result may be
    /// partial, which `audio_info` turns into `None`.
    pub fn parse(body: &str) -> SdpSession {
        let mut session = SdpSession::default();

        for line in body.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("c=") {
                // c=IN IP4 10.0.0.1
                let mut parts = rest.split_whitespace();
                if parts.next() == Some("IN") && parts.next() == Some("IP4") {
                    if let Some(addr) = parts.next() {
                        session.connection_address = Some(addr.to_string());
                    }
                }
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                // m=audio 40000 RTP/AVP 0 8 101
                let mut parts = rest.split_whitespace();
                if let Some(port) = parts.next().and_then(|p| p.parse::<u16>().ok()) {
                    session.audio_port = Some(port);
                }
                if parts.next() == Some("RTP/AVP") {
                    session.formats = parts.filter_map(|f| f.parse::<u8>().ok()).collect();
                }
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if let Some((pt, encoding)) = rest.split_once(' ') {
                    if let Ok(pt) = pt.parse::<u8>() {
                        session.rtpmaps.push((pt, encoding.to_string()));
                    }
                }
            }
        }

        session
    }

    /// The audio endpoint this SDP advertises, if complete.
    pub fn audio_info(&self) -> Option<MediaInfo> {
        Some(MediaInfo {
            address: self.connection_address.clone()?,
            port: self.audio_port?,
            formats: self.formats.clone(),
        })
    }
}

/// Build an audio SDP offer.
///
/// Codecs are listed in the given preference order; the DTMF payload type
/// gets a `telephone-event` rtpmap with the `0-15` event range, and iLBC
/// gets its `mode` fmtp parameter.
pub fn build_audio_sdp(
    ip: &str,
    port: u16,
    session_id: &str,
    codecs: &[u8],
    dtmf_payload_type: u8,
    ilbc_mode: u32,
) -> String {
    // SDP session ids are numeric tokens; anything else from the caller
    // (a Call-ID, typically) is reduced to its digits.
    let sess_id: String = session_id.chars().filter(|c| c.is_ascii_digit()).collect();
    let sess_id = if sess_id.is_empty() { "0".to_string() } else { sess_id };

    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- {} 0 IN IP4 {}", sess_id, ip),
        "s=tandem".to_string(),
        format!("c=IN IP4 {}", ip),
        "t=0 0".to_string(),
    ];

    let mut formats: Vec<String> = codecs.iter().map(|c| c.to_string()).collect();
    formats.push(dtmf_payload_type.to_string());
    lines.push(format!("m=audio {} RTP/AVP {}", port, formats.join(" ")));

    for &codec in codecs {
        if let Some((name, clock)) = rtpmap_entry(codec) {
            lines.push(format!("a=rtpmap:{} {}/{}", codec, name, clock));
            if codec == PT_ILBC {
                lines.push(format!("a=fmtp:{} mode={}", codec, ilbc_mode));
            }
        }
    }

    lines.push(format!("a=rtpmap:{} telephone-event/8000", dtmf_payload_type));
    lines.push(format!("a=fmtp:{} 0-15", dtmf_payload_type));
    lines.push("a=sendrecv".to_string());

    lines.join("\r\n") + "\r\n"
}

/// Parse an SDP body and require a complete audio endpoint.
pub fn parse_audio_endpoint(body: &str) -> Result<MediaInfo> {
    SdpSession::parse(body)
        .audio_info()
        .ok_or_else(|| Error::InvalidSdp("no audio media description".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_audio_session() {
        let body = "v=0\r\n\
            o=- 123 0 IN IP4 10.0.0.2\r\n\
            s=call\r\n\
            c=IN IP4 10.0.0.2\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 0 8 101\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            a=rtpmap:101 telephone-event/8000\r\n";

        let info = SdpSession::parse(body).audio_info().unwrap();
        assert_eq!(info.address, "10.0.0.2");
        assert_eq!(info.port, 40000);
        assert_eq!(info.formats, vec![0, 8, 101]);
    }

    #[test]
    fn accepts_lf_only_sdp() {
        let body = "v=0\nc=IN IP4 192.168.1.10\nm=audio 5000 RTP/AVP 8\n";
        let info = SdpSession::parse(body).audio_info().unwrap();
        assert_eq!(info.address, "192.168.1.10");
        assert_eq!(info.port, 5000);
    }

    #[test]
    fn missing_media_line_yields_none() {
        let body = "v=0\r\nc=IN IP4 10.0.0.2\r\n";
        assert!(SdpSession::parse(body).audio_info().is_none());
        assert!(parse_audio_endpoint(body).is_err());
    }

    #[test]
    fn build_lists_codecs_in_preference_order() {
        let sdp = build_audio_sdp("10.0.0.1", 10000, "abc123", &[PT_G722, PT_PCMU], 101, 30);
        assert!(sdp.contains("m=audio 10000 RTP/AVP 9 0 101\r\n"));
        assert!(sdp.contains("a=rtpmap:9 G722/8000\r\n"));
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(sdp.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(sdp.contains("a=fmtp:101 0-15\r\n"));
    }

    #[test]
    fn build_adds_ilbc_mode_fmtp() {
        let sdp = build_audio_sdp("10.0.0.1", 10000, "1", &[PT_ILBC], 101, 20);
        assert!(sdp.contains("a=rtpmap:97 iLBC/8000\r\n"));
        assert!(sdp.contains("a=fmtp:97 mode=20\r\n"));
    }

    #[test]
    fn built_sdp_round_trips_through_parser() {
        let sdp = build_audio_sdp("10.0.0.1", 12000, "42", &[PT_PCMU, PT_PCMA], 101, 30);
        let info = SdpSession::parse(&sdp).audio_info().unwrap();
        assert_eq!(info.address, "10.0.0.1");
        assert_eq!(info.port, 12000);
        assert_eq!(info.formats, vec![PT_PCMU, PT_PCMA, 101]);
    }
}
