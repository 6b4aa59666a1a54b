//! Header dissection helpers and telephone-number normalization
//!
//! The message codec leaves header values uninterpreted; the few pieces
//! the PBX actually needs out of them live here.

use crate::error::{Error, Result};

/// Extract the extension number from a From/To header or request-URI.
///
/// Matches the user part of the first `sip:` URI in the value, accepting a
/// leading `*` (voicemail access dialing) followed by digits.
pub fn extension_from_header(header: &str) -> Option<String> {
    let start = header.find("sip:")? + 4;
    let rest = &header[start..];

    let mut chars = rest.chars();
    let mut ext = String::new();
    match chars.next() {
        Some('*') => ext.push('*'),
        Some(c) if c.is_ascii_digit() => ext.push(c),
        _ => return None,
    }
    for c in chars {
        if c.is_ascii_digit() {
            ext.push(c);
        } else {
            break;
        }
    }

    // A bare "*" is not an extension
    if ext == "*" || ext.is_empty() {
        return None;
    }
    Some(ext)
}

/// The numeric part of a CSeq header value (`"314159 INVITE"` -> 314159).
pub fn cseq_number(cseq: &str) -> Result<u32> {
    cseq.split_whitespace()
        .next()
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| Error::InvalidHeader {
            name: "CSeq".to_string(),
            value: cseq.to_string(),
        })
}

/// Normalize a telephone number toward E.164.
///
/// Ten digits are assumed NANP and get a `+1` prefix; eleven or more get a
/// bare `+`. Input already carrying `+` is returned unchanged, which makes
/// the function idempotent. Shorter strings (extensions) pass through.
pub fn normalize_e164(number: &str) -> String {
    if number.starts_with('+') {
        return number.to_string();
    }

    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => format!("+1{}", digits),
        n if n >= 11 => format!("+{}", digits),
        _ => number.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_extension_from_from_header() {
        assert_eq!(
            extension_from_header("\"John\" <sip:1001@10.0.0.1>;tag=abc"),
            Some("1001".to_string())
        );
        assert_eq!(
            extension_from_header("<sip:1002@10.0.0.1:5060>"),
            Some("1002".to_string())
        );
    }

    #[test]
    fn extracts_voicemail_access_extension() {
        assert_eq!(
            extension_from_header("<sip:*1001@10.0.0.1>"),
            Some("*1001".to_string())
        );
    }

    #[test]
    fn rejects_non_numeric_user_parts() {
        assert_eq!(extension_from_header("<sip:alice@10.0.0.1>"), None);
        assert_eq!(extension_from_header("<sip:*@10.0.0.1>"), None);
        assert_eq!(extension_from_header("no uri here"), None);
    }

    #[test]
    fn cseq_number_parses_leading_integer() {
        assert_eq!(cseq_number("314159 INVITE").unwrap(), 314159);
        assert_eq!(cseq_number("1 REGISTER").unwrap(), 1);
        assert!(cseq_number("INVITE").is_err());
        assert!(cseq_number("").is_err());
    }

    #[test]
    fn e164_nanp_and_international() {
        assert_eq!(normalize_e164("2125551234"), "+12125551234");
        assert_eq!(normalize_e164("(212) 555-1234"), "+12125551234");
        assert_eq!(normalize_e164("442071234567"), "+442071234567");
        assert_eq!(normalize_e164("+442071234567"), "+442071234567");
    }

    #[test]
    fn e164_is_idempotent() {
        for n in ["2125551234", "+12125551234", "442071234567", "911", "1001"] {
            let once = normalize_e164(n);
            assert_eq!(normalize_e164(&once), once);
        }
    }

    #[test]
    fn short_strings_pass_through() {
        assert_eq!(normalize_e164("911"), "911");
        assert_eq!(normalize_e164("1001"), "1001");
    }
}
