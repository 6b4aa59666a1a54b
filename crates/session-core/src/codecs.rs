//! Codec selection by callee phone model
//!
//! Some deployed handsets negotiate badly when offered codecs they do
//! not implement, so the outbound INVITE's offer is narrowed by the
//! model the callee registered with. Anything unrecognised gets the
//! caller's own offer echoed through.

use tandem_sip_core::sdp::{PT_G722, PT_G726_32, PT_G729, PT_PCMA, PT_PCMU};

/// Handset models with restricted codec support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneModel {
    /// G.711 only
    Zip37G,
    /// G.726/G.729/G.722 only
    Zip33G,
}

/// Detect a restricted model from a registered User-Agent string.
pub fn detect_phone_model(user_agent: Option<&str>) -> Option<PhoneModel> {
    let ua = user_agent?.to_ascii_uppercase();
    if ua.contains("ZIP37G") {
        Some(PhoneModel::Zip37G)
    } else if ua.contains("ZIP33G") {
        Some(PhoneModel::Zip33G)
    } else {
        None
    }
}

/// The codec list to offer a callee.
///
/// Restricted models get their supported set; everyone else gets the
/// caller's offer (falling back to G.711 when the caller offered
/// nothing usable).
pub fn codecs_for_model(model: Option<PhoneModel>, caller_codecs: &[u8]) -> Vec<u8> {
    match model {
        Some(PhoneModel::Zip37G) => vec![PT_PCMU, PT_PCMA],
        Some(PhoneModel::Zip33G) => vec![PT_G726_32, PT_G729, PT_G722],
        None => {
            if caller_codecs.is_empty() {
                vec![PT_PCMU, PT_PCMA]
            } else {
                caller_codecs.to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_restricted_models() {
        assert_eq!(
            detect_phone_model(Some("ZIP37G v1.2.3")),
            Some(PhoneModel::Zip37G)
        );
        assert_eq!(
            detect_phone_model(Some("Vendor zip33g/2.0")),
            Some(PhoneModel::Zip33G)
        );
        assert_eq!(detect_phone_model(Some("Yealink SIP-T46S")), None);
        assert_eq!(detect_phone_model(None), None);
    }

    #[test]
    fn restricted_models_override_caller_offer() {
        let caller = vec![PT_G722, PT_PCMU];
        assert_eq!(
            codecs_for_model(Some(PhoneModel::Zip37G), &caller),
            vec![PT_PCMU, PT_PCMA]
        );
        assert_eq!(
            codecs_for_model(Some(PhoneModel::Zip33G), &caller),
            vec![PT_G726_32, PT_G729, PT_G722]
        );
    }

    #[test]
    fn unrestricted_echoes_caller_offer() {
        let caller = vec![PT_G722, PT_PCMU];
        assert_eq!(codecs_for_model(None, &caller), caller);
        assert_eq!(codecs_for_model(None, &[]), vec![PT_PCMU, PT_PCMA]);
    }
}
