//! REGISTER handling and device tracking
//!
//! The registrar authenticates REGISTER requests, refreshes the
//! in-memory binding, and mirrors what it learns about the device (MAC,
//! IP, user agent) into the store's phone-tracking table. Store failures
//! degrade: the in-memory registration is honored either way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_infra_common::{PbxStore, PhoneRegistration, WebhookEvent, WebhookSystem};
use tandem_sip_core::builder::normalize_mac;
use tandem_sip_core::{extension_from_header, SipMessage};

use crate::auth;
use crate::error::Result;
use crate::registry::ExtensionRegistry;
use crate::types::{AuthMode, RegistrarConfig};

/// Challenges are honored for this long.
const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Outcome of processing one REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Binding created or refreshed; answer 200 OK
    Registered { extension: String, expires: u32 },
    /// Expires: 0 cleared the binding; answer 200 OK
    Unregistered { extension: String },
    /// Credentials required; answer 401 with this WWW-Authenticate value
    Challenge { www_authenticate: String },
    /// Refused; answer 401
    Unauthorized,
}

/// The REGISTER handler
pub struct Registrar {
    registry: Arc<ExtensionRegistry>,
    store: Option<Arc<dyn PbxStore>>,
    webhooks: Arc<WebhookSystem>,
    config: RegistrarConfig,
    nonces: DashMap<String, Instant>,
}

impl Registrar {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        store: Option<Arc<dyn PbxStore>>,
        webhooks: Arc<WebhookSystem>,
        config: RegistrarConfig,
    ) -> Self {
        Registrar {
            registry,
            store,
            webhooks,
            config,
            nonces: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Boot-time reset: purge every phone row left by the previous
    /// process (then sweep rows with missing key fields), and seed the
    /// identity map from the store. Store errors here are fatal; a PBX
    /// that cannot read its extensions should not come up.
    pub async fn boot(&self) -> Result<()> {
        if let Some(store) = &self.store {
            let cleared = store.clear_phones().await?;
            let incomplete = store.remove_incomplete_phones().await?;
            info!(cleared, incomplete, "purged stale phone registrations");

            let seeded = self.registry.reload(store).await?;
            info!(seeded, "seeded extension registry");
        }
        Ok(())
    }

    /// Process one REGISTER request.
    pub async fn process_register(&self, msg: &SipMessage, src: SocketAddr) -> RegisterOutcome {
        let Some(from) = msg.header("From") else {
            warn!(%src, "REGISTER without From header");
            return RegisterOutcome::Unauthorized;
        };
        let Some(extension) = extension_from_header(from) else {
            warn!(%src, from, "could not parse extension from REGISTER");
            return RegisterOutcome::Unauthorized;
        };

        let Some(identity) = self.registry.lookup(&extension) else {
            warn!(%extension, %src, "REGISTER for unknown extension");
            return RegisterOutcome::Unauthorized;
        };

        if self.config.auth_mode == AuthMode::Credentials {
            match self.verify_credentials(msg, &identity.password_hash) {
                CredentialCheck::Verified => {}
                CredentialCheck::NeedsChallenge => return self.challenge(),
                CredentialCheck::Failed => {
                    warn!(%extension, %src, "REGISTER digest verification failed");
                    return RegisterOutcome::Unauthorized;
                }
            }
        }

        let expires = msg
            .header("Expires")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(self.config.default_expires_secs);

        if expires == 0 {
            self.registry.unregister(&extension);
            info!(%extension, %src, "extension unregistered");
            self.webhooks.trigger(
                WebhookEvent::ExtensionUnregistered,
                json!({ "extension": extension }),
            );
            return RegisterOutcome::Unregistered { extension };
        }

        let contact_uri = msg.header("Contact").map(contact_uri_of);
        let user_agent = msg.header("User-Agent").map(str::to_string);
        let mac = device_mac(msg);

        self.registry.register(
            &extension,
            src,
            contact_uri.clone(),
            user_agent.clone(),
            mac.clone(),
            expires,
        );
        info!(%extension, %src, expires, "extension registered");

        self.track_phone(&extension, src, mac, user_agent, contact_uri).await;

        self.webhooks.trigger(
            WebhookEvent::ExtensionRegistered,
            json!({ "extension": extension, "address": src.to_string(), "expires": expires }),
        );

        RegisterOutcome::Registered { extension, expires }
    }

    /// Spawn the periodic sweep that prunes expired bindings.
    pub fn start_expiry_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registrar = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(registrar.config.sweep_interval).await;
                for extension in registrar.registry.prune_expired() {
                    registrar.webhooks.trigger(
                        WebhookEvent::ExtensionUnregistered,
                        json!({ "extension": extension, "reason": "expired" }),
                    );
                }
            }
        })
    }

    fn challenge(&self) -> RegisterOutcome {
        // Drop stale nonces while we are here
        let now = Instant::now();
        self.nonces
            .retain(|_, issued| now.duration_since(*issued) < NONCE_LIFETIME);

        let nonce = auth::generate_nonce();
        self.nonces.insert(nonce.clone(), now);
        RegisterOutcome::Challenge {
            www_authenticate: format!(
                "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
                self.config.realm, nonce
            ),
        }
    }

    fn verify_credentials(&self, msg: &SipMessage, stored_ha1: &str) -> CredentialCheck {
        let Some(authorization) = msg.header("Authorization") else {
            return CredentialCheck::NeedsChallenge;
        };

        let nonce = auth::digest_param(authorization, "nonce");
        let uri = auth::digest_param(authorization, "uri");
        let response = auth::digest_param(authorization, "response");
        let (Some(nonce), Some(uri), Some(response)) = (nonce, uri, response) else {
            return CredentialCheck::NeedsChallenge;
        };

        // The nonce must be one we issued and still honor
        let known = self
            .nonces
            .get(nonce)
            .map(|issued| issued.elapsed() < NONCE_LIFETIME)
            .unwrap_or(false);
        if !known {
            return CredentialCheck::NeedsChallenge;
        }

        if auth::verify_digest(stored_ha1, "REGISTER", uri, nonce, response) {
            CredentialCheck::Verified
        } else {
            CredentialCheck::Failed
        }
    }

    /// Mirror the registration into the phone-tracking table,
    /// best-effort.
    async fn track_phone(
        &self,
        extension: &str,
        src: SocketAddr,
        mac: Option<String>,
        user_agent: Option<String>,
        contact_uri: Option<String>,
    ) {
        let Some(store) = &self.store else {
            return;
        };

        let registration = PhoneRegistration {
            extension: extension.to_string(),
            ip: Some(src.ip().to_string()),
            mac,
            user_agent,
            contact_uri,
        };

        match store.register_phone(registration).await {
            Ok(record) => debug!(extension, mac = ?record.mac, "phone tracking row refreshed"),
            Err(e) => warn!(
                extension,
                error = %e,
                "phone tracking not persisted; registration honored in memory"
            ),
        }
    }
}

enum CredentialCheck {
    Verified,
    NeedsChallenge,
    Failed,
}

/// The URI inside a Contact header, with display name and parameters
/// stripped.
fn contact_uri_of(contact: &str) -> String {
    if let Some(start) = contact.find('<') {
        if let Some(end) = contact[start..].find('>') {
            return contact[start + 1..start + end].to_string();
        }
    }
    contact.split(';').next().unwrap_or(contact).trim().to_string()
}

/// Device MAC from the X-MAC-Address header or a `;mac=` Contact
/// parameter, normalized.
fn device_mac(msg: &SipMessage) -> Option<String> {
    if let Some(mac) = msg.header("X-MAC-Address").and_then(normalize_mac) {
        return Some(mac);
    }
    let contact = msg.header("Contact")?;
    let mac_param = contact
        .split(';')
        .find_map(|p| p.trim().strip_prefix("mac="))?;
    normalize_mac(mac_param)
}
