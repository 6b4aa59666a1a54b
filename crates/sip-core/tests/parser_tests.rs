//! Round-trip properties for the SIP message codec
//!
//! Serializing a parsed message and parsing it again must preserve the
//! start-line, every header (compared case-insensitively) and the body.

use proptest::prelude::*;
use tandem_sip_core::{normalize_e164, Method, SipMessage};

fn method_strategy() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::Register),
        Just(Method::Invite),
        Just(Method::Ack),
        Just(Method::Bye),
        Just(Method::Cancel),
        Just(Method::Options),
        Just(Method::Info),
        Just(Method::Refer),
    ]
}

/// Header names: token chars, never colliding case-insensitively with
/// Content-Length (the serializer owns that header).
fn header_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9-]{0,18}"
        .prop_filter("reserved", |n| !n.eq_ignore_ascii_case("content-length"))
}

/// Header values: printable ASCII, no CR/LF, no surrounding whitespace
/// (parsing trims, so untrimmed input cannot round-trip byte-for-byte).
fn header_value() -> impl Strategy<Value = String> {
    "([!-~]([ -~]{0,30}[!-~])?)?"
}

fn headers_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec((header_name(), header_value()), 0..8).prop_map(|headers| {
        // Duplicate names (case-insensitively) collapse on set_header;
        // keep the first of each so the expectation is well-defined.
        let mut seen: Vec<String> = Vec::new();
        let mut out = Vec::new();
        for (name, value) in headers {
            let key = name.to_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                out.push((name, value));
            }
        }
        out
    })
}

/// Bodies: printable lines joined with CRLF.
fn body_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[ -~]{0,40}", 0..4).prop_map(|lines| {
        let joined = lines.join("\r\n");
        // A trailing empty line cannot survive the join/split cycle
        joined.trim_end_matches("\r\n").to_string()
    })
}

proptest! {
    #[test]
    fn request_round_trip(
        method in method_strategy(),
        uri in "sip:[0-9]{3,5}@[a-z0-9.]{3,12}",
        headers in headers_strategy(),
        body in body_strategy(),
    ) {
        let mut original = SipMessage::new();
        original.method = Some(method.clone());
        original.uri = Some(uri.clone());
        for (name, value) in &headers {
            original.set_header(name, value.clone());
        }
        original.body = body.clone();

        let wire = original.build();
        let parsed = SipMessage::parse(&wire);

        prop_assert_eq!(parsed.method.clone(), Some(method));
        prop_assert_eq!(parsed.uri.clone(), Some(uri));
        prop_assert_eq!(parsed.version.as_str(), "SIP/2.0");
        for (name, value) in &headers {
            prop_assert_eq!(parsed.header(name), Some(value.as_str()));
        }
        let content_length = body.len().to_string();
        prop_assert_eq!(
            parsed.header("Content-Length"),
            Some(content_length.as_str())
        );
        prop_assert_eq!(parsed.body, body);
    }

    #[test]
    fn response_round_trip(
        status in 100u16..700,
        reason in "[A-Za-z][A-Za-z ]{0,20}[A-Za-z]",
        headers in headers_strategy(),
        body in body_strategy(),
    ) {
        let mut original = SipMessage::new();
        original.status_code = Some(status);
        original.reason = Some(reason.clone());
        for (name, value) in &headers {
            original.set_header(name, value.clone());
        }
        original.body = body.clone();

        let wire = original.build();
        let parsed = SipMessage::parse(&wire);

        prop_assert_eq!(parsed.status_code, Some(status));
        prop_assert_eq!(parsed.reason.clone(), Some(reason));
        for (name, value) in &headers {
            prop_assert_eq!(parsed.header(name), Some(value.as_str()));
        }
        prop_assert_eq!(parsed.body, body);
    }

    #[test]
    fn serialization_is_a_parse_fixpoint(
        method in method_strategy(),
        uri in "sip:[0-9]{3,5}@[a-z0-9.]{3,12}",
        headers in headers_strategy(),
        body in body_strategy(),
    ) {
        let mut original = SipMessage::new();
        original.method = Some(method);
        original.uri = Some(uri);
        for (name, value) in &headers {
            original.set_header(name, value.clone());
        }
        original.body = body;

        let wire = original.build();
        let mut reparsed = SipMessage::parse(&wire);
        prop_assert_eq!(reparsed.build(), wire);
    }

    #[test]
    fn e164_normalization_is_idempotent(number in "[0-9+() -]{0,16}") {
        let once = normalize_e164(&number);
        prop_assert_eq!(normalize_e164(&once), once);
    }
}

#[test]
fn parses_messages_with_mixed_line_endings() {
    // A message mangled by a non-conformant device: CRLF start line, LF
    // headers, CR separator.
    let raw = "INVITE sip:1002@pbx SIP/2.0\r\nCall-ID: mixed-1\nCSeq: 1 INVITE\r\r";
    let msg = SipMessage::parse(raw);
    assert_eq!(msg.method, Some(Method::Invite));
    assert_eq!(msg.call_id(), Some("mixed-1"));
    assert_eq!(msg.header("cseq"), Some("1 INVITE"));
}
