//! Typed configuration
//!
//! Every recognised option is a field with a default; configuration is
//! parsed once at startup from TOML and never consulted as a dynamic
//! dictionary afterwards. Unrecognised keys are warned about rather
//! than rejected, so a config written for a newer build degrades
//! loudly instead of failing silently.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use tandem_registrar_core::AuthMode;
use tandem_rtp_core::QosThresholds;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PbxConfig {
    pub server: ServerConfig,
    pub voicemail: VoicemailConfig,
    pub sip: SipConfig,
    pub dialplan: DialplanConfig,
    pub qos: QosConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub sip_port: u16,
    /// Advertised address; auto-detected when absent
    pub external_ip: Option<String>,
    pub rtp_port_start: u16,
    pub rtp_port_end: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            sip_port: 5060,
            external_ip: None,
            rtp_port_start: 10_000,
            rtp_port_end: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoicemailConfig {
    /// Seconds before an unanswered call diverts to voicemail
    pub no_answer_timeout: u64,
    /// Maximum recording length in seconds
    pub max_message_duration: u64,
}

impl Default for VoicemailConfig {
    fn default() -> Self {
        VoicemailConfig {
            no_answer_timeout: 30,
            max_message_duration: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SipConfig {
    pub auth: SipAuthConfig,
    pub caller_id: CallerIdConfig,
    pub device: DeviceConfig,
    pub dtmf: DtmfConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SipAuthConfig {
    pub mode: AuthMode,
    pub realm: String,
}

impl Default for SipAuthConfig {
    fn default() -> Self {
        SipAuthConfig {
            mode: AuthMode::Credentials,
            realm: "tandem".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallerIdConfig {
    pub send_p_asserted_identity: bool,
    pub send_remote_party_id: bool,
}

impl Default for CallerIdConfig {
    fn default() -> Self {
        CallerIdConfig {
            send_p_asserted_identity: true,
            send_remote_party_id: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub send_mac_address: bool,
    pub accept_mac_in_invite: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            send_mac_address: true,
            accept_mac_in_invite: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    /// RFC 2833 telephone-event payload type
    pub payload_type: u8,
    pub ilbc_mode: u32,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        DtmfConfig {
            payload_type: 101,
            ilbc_mode: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialplanConfig {
    pub emergency_pattern: String,
    pub internal_pattern: String,
    pub conference_pattern: String,
    pub voicemail_pattern: String,
    pub queue_pattern: String,
    pub parking_pattern: String,
    pub auto_attendant_pattern: String,
    pub paging_pattern: String,
    /// Extension the auto-attendant answers on
    pub auto_attendant_extension: String,
}

impl Default for DialplanConfig {
    fn default() -> Self {
        DialplanConfig {
            emergency_pattern: "^9?-?911$".to_string(),
            internal_pattern: "^1[0-9]{3}$".to_string(),
            conference_pattern: "^2[0-9]{3}$".to_string(),
            voicemail_pattern: "^\\*[0-9]{3,4}$".to_string(),
            queue_pattern: "^8[0-9]{3}$".to_string(),
            parking_pattern: "^7[0-9]$".to_string(),
            auto_attendant_pattern: "^0$".to_string(),
            paging_pattern: "^7[0-9]$".to_string(),
            auto_attendant_extension: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Recompute expensive QoS figures every Nth packet
    pub sample_every: u64,
    pub thresholds: QosThresholds,
}

impl Default for QosConfig {
    fn default() -> Self {
        QosConfig {
            sample_every: 10,
            thresholds: QosThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds active calls get to drain before being force-ended
    pub grace_period: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig { grace_period: 30 }
    }
}

impl PbxConfig {
    /// Parse a TOML config file, warning on unrecognised keys.
    pub fn load(path: &Path) -> anyhow::Result<PbxConfig> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<PbxConfig> {
        let raw: toml::Value = text.parse()?;
        warn_unknown_keys(&raw);
        Ok(raw.try_into()?)
    }
}

/// Walk the raw config and warn about keys no release of this server has
/// ever recognised.
fn warn_unknown_keys(raw: &toml::Value) {
    const KNOWN: &[(&str, &[&str])] = &[
        ("", &["server", "voicemail", "sip", "dialplan", "qos", "shutdown"]),
        ("server", &["sip_port", "external_ip", "rtp_port_start", "rtp_port_end"]),
        ("voicemail", &["no_answer_timeout", "max_message_duration"]),
        ("sip", &["auth", "caller_id", "device", "dtmf"]),
        ("sip.auth", &["mode", "realm"]),
        ("sip.caller_id", &["send_p_asserted_identity", "send_remote_party_id"]),
        ("sip.device", &["send_mac_address", "accept_mac_in_invite"]),
        ("sip.dtmf", &["payload_type", "ilbc_mode"]),
        (
            "dialplan",
            &[
                "emergency_pattern",
                "internal_pattern",
                "conference_pattern",
                "voicemail_pattern",
                "queue_pattern",
                "parking_pattern",
                "auto_attendant_pattern",
                "paging_pattern",
                "auto_attendant_extension",
            ],
        ),
        ("qos", &["sample_every", "thresholds"]),
        ("qos.thresholds", &["mos_min", "packet_loss_max", "jitter_max", "latency_max"]),
        ("shutdown", &["grace_period"]),
    ];

    fn walk(value: &toml::Value, prefix: &str, known: &[(&str, &[&str])]) {
        let Some(table) = value.as_table() else {
            return;
        };
        let Some((_, keys)) = known.iter().find(|(p, _)| *p == prefix) else {
            return;
        };
        for (key, child) in table {
            if !keys.contains(&key.as_str()) {
                warn!(
                    key = %if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") },
                    "unrecognised configuration key ignored"
                );
                continue;
            }
            let child_prefix = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            walk(child, &child_prefix, known);
        }
    }

    walk(raw, "", KNOWN);
}
