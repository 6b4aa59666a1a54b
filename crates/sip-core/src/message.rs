//! SIP message representation, parsing and serialization
//!
//! One [`SipMessage`] type covers both requests and responses, mirroring
//! the wire format: a start-line, a header list and a body. The header
//! list preserves insertion order and the case the sender used, while
//! lookups are case-insensitive per RFC 3261 section 7.3.1.

use std::fmt;
use std::str::FromStr;

/// SIP request methods
///
/// Unrecognised tokens are carried verbatim in [`Method::Other`] so the
/// transaction layer can still answer them with 405.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Subscribe,
    Notify,
    Prack,
    Update,
    Publish,
    Message,
    Refer,
    /// Any method token this stack does not implement
    Other(String),
}

impl Method {
    /// Methods advertised in `Allow` headers (OPTIONS, 405 responses).
    pub const ALLOWED: &'static str =
        "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, INFO, SUBSCRIBE, NOTIFY, PRACK, UPDATE, PUBLISH, MESSAGE, REFER";
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "PUBLISH" => Method::Publish,
            "MESSAGE" => Method::Message,
            "REFER" => Method::Refer,
            other => Method::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Publish => "PUBLISH",
            Method::Message => "MESSAGE",
            Method::Refer => "REFER",
            Method::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// A parsed SIP message (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    /// Request method; `None` for responses and malformed start-lines
    pub method: Option<Method>,
    /// Request-URI; `None` for responses
    pub uri: Option<String>,
    /// Protocol version, normally `SIP/2.0`
    pub version: String,
    /// Response status code; `None` for requests and malformed start-lines
    pub status_code: Option<u16>,
    /// Response reason phrase
    pub reason: Option<String>,
    /// Headers in insertion order with original case preserved
    headers: Vec<(String, String)>,
    /// Message body
    pub body: String,
}

impl Default for SipMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl SipMessage {
    /// Create an empty message
    pub fn new() -> Self {
        SipMessage {
            method: None,
            uri: None,
            version: "SIP/2.0".to_string(),
            status_code: None,
            reason: None,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Parse a raw datagram into a message.
    ///
    /// Never fails: CRLF, bare CR and bare LF line endings are all
    /// accepted, and a malformed start-line leaves both `method` and
    /// `status_code` unset for the caller to detect.
    pub fn parse(raw: &str) -> SipMessage {
        let mut msg = SipMessage::new();

        let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
        let lines: Vec<&str> = normalized.split('\n').collect();

        let Some(first_line) = lines.first() else {
            return msg;
        };

        if first_line.starts_with("SIP/") {
            // Response: version, status code, reason phrase
            let mut parts = first_line.splitn(3, ' ');
            let version = parts.next().unwrap_or_default();
            let Some(code) = parts.next().and_then(|c| c.parse::<u16>().ok()) else {
                return msg;
            };
            msg.version = version.to_string();
            msg.status_code = Some(code);
            msg.reason = Some(parts.next().unwrap_or("").to_string());
        } else {
            // Request: method, request-URI, version
            let parts: Vec<&str> = first_line.split(' ').collect();
            if parts.len() < 2 || parts[0].is_empty() {
                return msg;
            }
            msg.method = parts[0].parse::<Method>().ok();
            msg.uri = Some(parts[1].to_string());
            if parts.len() > 2 {
                msg.version = parts[2].to_string();
            }
        }

        let mut body_start = None;
        for (i, line) in lines.iter().enumerate().skip(1) {
            if line.is_empty() {
                body_start = Some(i + 1);
                break;
            }
            // RFC 3261 line folding: a continuation line starting with
            // whitespace extends the previous header value
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = msg.headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                msg.headers
                    .push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        if let Some(start) = body_start {
            if start < lines.len() {
                msg.body = lines[start..].join("\r\n");
            }
        }

        // Serialized messages end with CRLF, which the line split turns
        // into a trailing empty body segment. Content-Length, when sane,
        // frames the body exactly; otherwise strip the one artifact.
        if let Some(len) = msg
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            if len < msg.body.len() {
                if let Some(framed) = msg.body.get(..len) {
                    msg.body = framed.to_string();
                }
            }
        } else if msg.body.ends_with("\r\n") {
            msg.body.truncate(msg.body.len() - 2);
        }

        msg
    }

    /// Look up a header value, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header value.
    ///
    /// An existing header with a case-insensitively equal name is replaced
    /// in place, keeping its position and original case; otherwise the
    /// header is appended.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    /// Remove a header, case-insensitively
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Iterate headers in insertion order
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// True if the message parsed as a request
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// True if the message parsed as a response
    pub fn is_response(&self) -> bool {
        self.status_code.is_some()
    }

    /// The Call-ID header, if present
    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Serialize to wire form.
    ///
    /// Emits CRLF line endings exclusively, the blank line separating
    /// headers from the body, and the terminating CRLF RFC 3261 requires.
    /// Content-Length is set from the body length.
    pub fn build(&mut self) -> String {
        self.set_header("Content-Length", self.body.len().to_string());

        let mut lines: Vec<String> = Vec::with_capacity(self.headers.len() + 3);

        if let Some(method) = &self.method {
            lines.push(format!(
                "{} {} {}",
                method,
                self.uri.as_deref().unwrap_or(""),
                self.version
            ));
        } else {
            lines.push(format!(
                "{} {} {}",
                self.version,
                self.status_code.unwrap_or(0),
                self.reason.as_deref().unwrap_or("")
            ));
        }

        for (name, value) in &self.headers {
            lines.push(format!("{}: {}", name, value));
        }

        lines.push(String::new());

        if !self.body.is_empty() {
            lines.push(self.body.clone());
        }

        lines.join("\r\n") + "\r\n"
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clone().build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:1002@10.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK776asdhds\r\n\
        From: <sip:1001@10.0.0.1>;tag=1928301774\r\n\
        To: <sip:1002@10.0.0.1>\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn parses_request_line() {
        let msg = SipMessage::parse(INVITE);
        assert_eq!(msg.method, Some(Method::Invite));
        assert_eq!(msg.uri.as_deref(), Some("sip:1002@10.0.0.1"));
        assert_eq!(msg.version, "SIP/2.0");
        assert!(msg.is_request());
        assert!(!msg.is_response());
    }

    #[test]
    fn parses_response_line() {
        let msg = SipMessage::parse("SIP/2.0 180 Ringing\r\nCall-ID: x\r\n\r\n");
        assert_eq!(msg.status_code, Some(180));
        assert_eq!(msg.reason.as_deref(), Some("Ringing"));
        assert!(msg.is_response());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let msg = SipMessage::parse(INVITE);
        assert_eq!(msg.header("call-id"), Some("a84b4c76e66710"));
        assert_eq!(msg.header("CALL-ID"), Some("a84b4c76e66710"));
        assert_eq!(msg.header("Call-ID"), Some("a84b4c76e66710"));
    }

    #[test]
    fn set_header_replaces_case_insensitively_in_place() {
        let mut msg = SipMessage::parse(INVITE);
        msg.set_header("call-id", "other");
        assert_eq!(msg.header("Call-ID"), Some("other"));
        // Still exactly one Call-ID header, at its original position
        let names: Vec<&str> = msg.headers().map(|(n, _)| n).collect();
        assert_eq!(names.iter().filter(|n| n.eq_ignore_ascii_case("call-id")).count(), 1);
        assert_eq!(names[3], "Call-ID");
    }

    #[test]
    fn accepts_lf_only_line_endings() {
        let raw = "REGISTER sip:10.0.0.1 SIP/2.0\nFrom: <sip:1001@10.0.0.1>\nCall-ID: reg-1\n\n";
        let msg = SipMessage::parse(raw);
        assert_eq!(msg.method, Some(Method::Register));
        assert_eq!(msg.call_id(), Some("reg-1"));
    }

    #[test]
    fn accepts_cr_only_line_endings() {
        let raw = "OPTIONS sip:10.0.0.1 SIP/2.0\rCall-ID: opt-1\r\r";
        let msg = SipMessage::parse(raw);
        assert_eq!(msg.method, Some(Method::Options));
        assert_eq!(msg.call_id(), Some("opt-1"));
    }

    #[test]
    fn malformed_start_line_is_neither_request_nor_response() {
        let msg = SipMessage::parse("garbage\r\n\r\n");
        assert!(!msg.is_request());
        assert!(!msg.is_response());

        let msg = SipMessage::parse("SIP/2.0 notanumber OK\r\n\r\n");
        assert!(!msg.is_request());
        assert!(!msg.is_response());
    }

    #[test]
    fn body_survives_parse_and_build() {
        let raw = "INFO sip:1001@10.0.0.1 SIP/2.0\r\nCall-ID: dtmf-1\r\nContent-Length: 24\r\n\r\nSignal=5\r\nDuration=160";
        let msg = SipMessage::parse(raw);
        assert_eq!(msg.body, "Signal=5\r\nDuration=160");
    }

    #[test]
    fn build_sets_content_length_and_crlf_endings() {
        let mut msg = SipMessage::new();
        msg.method = Some(Method::Info);
        msg.uri = Some("sip:1001@10.0.0.1".to_string());
        msg.set_header("Call-ID", "dtmf-2");
        msg.body = "Signal=1\r\nDuration=100".to_string();

        let wire = msg.build();
        assert!(wire.contains("Content-Length: 22\r\n"));
        assert!(wire.ends_with("\r\n"));
        assert!(!wire.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn folded_header_values_are_unfolded() {
        let raw = "INVITE sip:1002@10.0.0.1 SIP/2.0\r\n\
            Subject: a call\r\n\
            \tthat spans lines\r\n\
            Call-ID: fold-1\r\n\
            \r\n";
        let msg = SipMessage::parse(raw);
        assert_eq!(msg.header("Subject"), Some("a call that spans lines"));
        assert_eq!(msg.call_id(), Some("fold-1"));
    }

    #[test]
    fn unknown_method_is_preserved() {
        let msg = SipMessage::parse("WOBBLE sip:x@y SIP/2.0\r\n\r\n");
        assert_eq!(msg.method, Some(Method::Other("WOBBLE".to_string())));
        assert_eq!(msg.method.unwrap().to_string(), "WOBBLE");
    }
}
