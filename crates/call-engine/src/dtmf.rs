//! SIP INFO DTMF body parsing
//!
//! Phones without RFC 2833 support signal digits out of band:
//!
//! ```text
//! Signal=5
//! Duration=160
//! ```
//!
//! under Content-Type `application/dtmf-relay` or `application/dtmf`
//! (an optional `;charset=` parameter is tolerated).

/// A digit extracted from an INFO body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfInfo {
    pub digit: char,
    /// Signal duration in milliseconds, when the body carried one
    pub duration_ms: Option<u32>,
}

/// Whether a Content-Type announces a DTMF body.
pub fn is_dtmf_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    media_type == "application/dtmf-relay" || media_type == "application/dtmf"
}

/// Parse an INFO DTMF body. Returns `None` for anything but a single
/// valid digit (0-9, *, #, A-D).
pub fn parse_dtmf_body(body: &str) -> Option<DtmfInfo> {
    let mut digit = None;
    let mut duration_ms = None;

    for line in body.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Signal=") {
            let value = value.trim();
            let mut chars = value.chars();
            let candidate = chars.next()?;
            if chars.next().is_some() {
                return None;
            }
            let candidate = candidate.to_ascii_uppercase();
            if !matches!(candidate, '0'..='9' | '*' | '#' | 'A'..='D') {
                return None;
            }
            digit = Some(candidate);
        } else if let Some(value) = line.strip_prefix("Duration=") {
            duration_ms = value.trim().parse::<u32>().ok();
        }
    }

    Some(DtmfInfo {
        digit: digit?,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_content_types() {
        assert!(is_dtmf_content_type("application/dtmf-relay"));
        assert!(is_dtmf_content_type("application/dtmf"));
        assert!(is_dtmf_content_type("application/dtmf-relay; charset=utf-8"));
        assert!(is_dtmf_content_type("Application/DTMF"));
        assert!(!is_dtmf_content_type("application/sdp"));
        assert!(!is_dtmf_content_type("text/plain"));
    }

    #[test]
    fn parses_signal_and_duration() {
        let info = parse_dtmf_body("Signal=5\r\nDuration=160").unwrap();
        assert_eq!(info.digit, '5');
        assert_eq!(info.duration_ms, Some(160));
    }

    #[test]
    fn parses_all_valid_digits() {
        for digit in "0123456789*#ABCD".chars() {
            let info = parse_dtmf_body(&format!("Signal={digit}\nDuration=100")).unwrap();
            assert_eq!(info.digit, digit, "{digit}");
        }
        // Lowercase letters normalize
        assert_eq!(parse_dtmf_body("Signal=a").unwrap().digit, 'A');
    }

    #[test]
    fn rejects_invalid_signals() {
        assert!(parse_dtmf_body("Signal=E").is_none());
        assert!(parse_dtmf_body("Signal=12").is_none());
        assert!(parse_dtmf_body("Signal=").is_none());
        assert!(parse_dtmf_body("Duration=160").is_none());
        assert!(parse_dtmf_body("").is_none());
    }

    #[test]
    fn duration_is_optional() {
        let info = parse_dtmf_body("Signal=#").unwrap();
        assert_eq!(info.digit, '#');
        assert_eq!(info.duration_ms, None);
    }
}
