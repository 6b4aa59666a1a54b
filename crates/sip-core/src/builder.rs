//! Constructors for the messages the transaction layer sends
//!
//! Responses copy the dialog-identifying headers from the request they
//! answer; requests get their CSeq composed as `"<n> <METHOD>"`. The
//! caller-identity and device-MAC helpers write the header forms the
//! deployed phone fleet expects.

use crate::message::{Method, SipMessage};

/// Headers copied verbatim from a request into its response.
const ECHOED_HEADERS: [&str; 5] = ["Via", "From", "To", "Call-ID", "CSeq"];

/// Build a response to `request`, echoing Via, From, To, Call-ID and CSeq.
pub fn build_response(
    status_code: u16,
    reason: &str,
    request: &SipMessage,
    body: Option<&str>,
) -> SipMessage {
    let mut response = SipMessage::new();
    response.status_code = Some(status_code);
    response.reason = Some(reason.to_string());

    for name in ECHOED_HEADERS {
        if let Some(value) = request.header(name) {
            response.set_header(name, value);
        }
    }

    if let Some(body) = body {
        response.body = body.to_string();
    }

    response
}

/// Build a request with the given dialog identifiers.
///
/// CSeq is composed as `"<cseq> <METHOD>"`; Content-Length is handled by
/// [`SipMessage::build`].
pub fn build_request(
    method: Method,
    uri: &str,
    from: &str,
    to: &str,
    call_id: &str,
    cseq: u32,
    body: Option<&str>,
) -> SipMessage {
    let mut request = SipMessage::new();
    request.uri = Some(uri.to_string());
    request.set_header("From", from);
    request.set_header("To", to);
    request.set_header("Call-ID", call_id);
    request.set_header("CSeq", format!("{} {}", cseq, method));
    request.method = Some(method);

    if let Some(body) = body {
        request.body = body.to_string();
    }

    request
}

/// Add P-Asserted-Identity (RFC 3325) and Remote-Party-ID headers.
///
/// Remote-Party-ID is the legacy form but still the one most desk phones
/// use for line-appearance display.
pub fn add_caller_identity_headers(
    message: &mut SipMessage,
    extension: &str,
    display_name: &str,
    server_ip: &str,
) {
    let identity = format!("\"{}\" <sip:{}@{}>", display_name, extension, server_ip);
    message.set_header("P-Asserted-Identity", identity.clone());
    message.set_header(
        "Remote-Party-ID",
        format!("{};party=calling;privacy=off;screen=no", identity),
    );
}

/// Add an `X-MAC-Address` device header.
///
/// The MAC is accepted with `:`, `-` or `.` separators or none at all and
/// emitted lowercase colon-delimited. Anything that does not reduce to
/// exactly 12 hex digits is silently ignored.
pub fn add_mac_address_header(message: &mut SipMessage, mac: &str) {
    if let Some(formatted) = normalize_mac(mac) {
        message.set_header("X-MAC-Address", formatted);
    }
}

/// Normalize a MAC address to lowercase colon-delimited form.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let clean: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect::<String>()
        .to_lowercase();

    if clean.len() != 12 || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let pairs: Vec<&str> = (0..12).step_by(2).map(|i| &clean[i..i + 2]).collect();
    Some(pairs.join(":"))
}
