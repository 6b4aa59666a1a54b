//! Registrar data types

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tandem_infra_common::ExtensionRecord;

/// How REGISTER requests are authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Digest challenge/response against stored credentials
    Credentials,
    /// Accept any REGISTER from the LAN; for closed deployments only
    TrustIp,
}

/// Registrar configuration
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub auth_mode: AuthMode,
    /// Binding lifetime when the phone sends no Expires header
    pub default_expires_secs: u32,
    /// How often the expiry sweep runs
    pub sweep_interval: Duration,
    /// Digest realm
    pub realm: String,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            auth_mode: AuthMode::Credentials,
            default_expires_secs: 3600,
            sweep_interval: Duration::from_secs(30),
            realm: "tandem".to_string(),
        }
    }
}

/// An extension identity held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub number: String,
    pub name: String,
    pub email: Option<String>,
    /// Digest HA1 credential
    pub password_hash: String,
    /// Digest realm the credential was computed under
    pub password_salt: String,
    pub allow_external: bool,
    pub voicemail_pin_hash: Option<String>,
    pub voicemail_pin_salt: Option<String>,
    pub ad_synced: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<ExtensionRecord> for Extension {
    fn from(record: ExtensionRecord) -> Self {
        Extension {
            number: record.number,
            name: record.name,
            email: record.email,
            password_hash: record.password_hash,
            password_salt: record.password_salt,
            allow_external: record.allow_external,
            voicemail_pin_hash: record.voicemail_pin_hash,
            voicemail_pin_salt: record.voicemail_pin_salt,
            ad_synced: record.ad_synced,
            updated_at: record.updated_at,
        }
    }
}

/// A transient binding of an extension to a network location.
///
/// At most one active binding exists per extension; a re-REGISTER
/// refreshes the record in place, preserving `first_seen` and any
/// previously learned MAC the refresh does not carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub extension: String,
    pub contact_uri: Option<String>,
    pub address: SocketAddr,
    pub user_agent: Option<String>,
    pub mac: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Registration {
    /// Active means the expiry deadline has not passed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
