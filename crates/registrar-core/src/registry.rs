//! In-memory extension registry
//!
//! Identity lookups and transient contact bindings for every extension
//! the PBX serves. Identities come from the store; bindings come from
//! REGISTER handling and die by expiry.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use tandem_infra_common::{PbxStore, StoreResult};

use crate::types::{Extension, Registration};

/// Registry of extension identities and their active registrations
#[derive(Default)]
pub struct ExtensionRegistry {
    identities: DashMap<String, Extension>,
    registrations: DashMap<String, Registration>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all identities from the store. Transient registration
    /// state is dropped; phones re-REGISTER on their own schedule.
    pub async fn reload(&self, store: &Arc<dyn PbxStore>) -> StoreResult<usize> {
        let records = store.load_extensions().await?;
        self.identities.clear();
        self.registrations.clear();
        let count = records.len();
        for record in records {
            let extension = Extension::from(record);
            self.identities.insert(extension.number.clone(), extension);
        }
        info!(count, "extension registry reloaded from store");
        Ok(count)
    }

    /// Insert or replace one identity (administrative action, tests).
    pub fn upsert_identity(&self, extension: Extension) {
        self.identities.insert(extension.number.clone(), extension);
    }

    /// Identity lookup; says nothing about registration state.
    pub fn lookup(&self, extension: &str) -> Option<Extension> {
        self.identities.get(extension).map(|e| e.clone())
    }

    /// Whether the extension currently has an unexpired binding.
    pub fn is_registered(&self, extension: &str) -> bool {
        self.registrations
            .get(extension)
            .map(|r| r.is_active(Utc::now()))
            .unwrap_or(false)
    }

    /// The network address of an extension's active binding.
    pub fn contact_of(&self, extension: &str) -> Option<SocketAddr> {
        let registration = self.registrations.get(extension)?;
        registration.is_active(Utc::now()).then(|| registration.address)
    }

    /// The full active registration record.
    pub fn registration_of(&self, extension: &str) -> Option<Registration> {
        let registration = self.registrations.get(extension)?;
        registration
            .is_active(Utc::now())
            .then(|| registration.clone())
    }

    /// Create or refresh a binding.
    ///
    /// One binding per extension: a refresh updates in place, keeping
    /// `first_seen` and a previously learned MAC when the refresh does
    /// not carry one.
    pub fn register(
        &self,
        extension: &str,
        address: SocketAddr,
        contact_uri: Option<String>,
        user_agent: Option<String>,
        mac: Option<String>,
        expires_secs: u32,
    ) -> Registration {
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(i64::from(expires_secs));

        let mut entry = self
            .registrations
            .entry(extension.to_string())
            .or_insert_with(|| Registration {
                extension: extension.to_string(),
                contact_uri: contact_uri.clone(),
                address,
                user_agent: user_agent.clone(),
                mac: mac.clone(),
                first_seen: now,
                last_seen: now,
                expires_at,
            });

        let registration = entry.value_mut();
        registration.address = address;
        registration.last_seen = now;
        registration.expires_at = expires_at;
        if contact_uri.is_some() {
            registration.contact_uri = contact_uri;
        }
        if user_agent.is_some() {
            registration.user_agent = user_agent;
        }
        if mac.is_some() {
            registration.mac = mac;
        }
        registration.clone()
    }

    /// Drop an extension's binding.
    pub fn unregister(&self, extension: &str) -> bool {
        self.registrations.remove(extension).is_some()
    }

    /// Remove expired bindings and return the extensions that lost
    /// theirs.
    pub fn prune_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .registrations
            .iter()
            .filter(|entry| !entry.is_active(now))
            .map(|entry| entry.key().clone())
            .collect();
        for extension in &expired {
            self.registrations.remove(extension);
            warn!(%extension, "registration expired");
        }
        expired
    }

    /// The stored User-Agent for an extension's device, used for codec
    /// selection toward that phone.
    pub fn user_agent_of(&self, extension: &str) -> Option<String> {
        self.registrations.get(extension)?.user_agent.clone()
    }

    /// The learned MAC for an extension's device.
    pub fn mac_of(&self, extension: &str) -> Option<String> {
        self.registrations.get(extension)?.mac.clone()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth;
    use chrono::Utc;
    use tandem_infra_common::{ExtensionRecord, MemoryStore};

    fn identity(number: &str) -> Extension {
        Extension {
            number: number.to_string(),
            name: format!("Extension {number}"),
            email: None,
            password_hash: auth::ha1(number, "tandem", "secret"),
            password_salt: "tandem".to_string(),
            allow_external: false,
            voicemail_pin_hash: None,
            voicemail_pin_salt: None,
            ad_synced: false,
            updated_at: Utc::now(),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.2:{port}").parse().unwrap()
    }

    #[test]
    fn registered_implies_contact() {
        let registry = ExtensionRegistry::new();
        registry.upsert_identity(identity("1001"));

        assert!(!registry.is_registered("1001"));
        assert_eq!(registry.contact_of("1001"), None);

        registry.register("1001", addr(5060), None, None, None, 3600);
        assert!(registry.is_registered("1001"));
        assert_eq!(registry.contact_of("1001"), Some(addr(5060)));
    }

    #[test]
    fn refresh_updates_in_place() {
        let registry = ExtensionRegistry::new();
        let first = registry.register(
            "1001",
            addr(5060),
            Some("sip:1001@10.0.0.2".to_string()),
            Some("Yealink SIP-T46S".to_string()),
            Some("00:11:22:33:44:55".to_string()),
            3600,
        );

        // Refresh without MAC or user agent
        let refreshed = registry.register("1001", addr(5061), None, None, None, 3600);

        assert_eq!(registry.registration_count(), 1);
        assert_eq!(refreshed.first_seen, first.first_seen);
        assert_eq!(refreshed.address, addr(5061));
        assert_eq!(refreshed.mac.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(refreshed.user_agent.as_deref(), Some("Yealink SIP-T46S"));
        assert!(refreshed.last_seen >= first.last_seen);
    }

    #[test]
    fn expired_binding_is_not_registered() {
        let registry = ExtensionRegistry::new();
        registry.register("1001", addr(5060), None, None, None, 0);
        // expires_at == now, so the binding is already dead
        assert!(!registry.is_registered("1001"));
        assert_eq!(registry.contact_of("1001"), None);

        let expired = registry.prune_expired();
        assert_eq!(expired, vec!["1001".to_string()]);
        assert_eq!(registry.registration_count(), 0);
    }

    #[test]
    fn unregister_clears_binding() {
        let registry = ExtensionRegistry::new();
        registry.register("1001", addr(5060), None, None, None, 3600);
        assert!(registry.unregister("1001"));
        assert!(!registry.is_registered("1001"));
        assert!(!registry.unregister("1001"));
    }

    #[tokio::test]
    async fn reload_reseeds_identities_and_drops_bindings() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_extension(ExtensionRecord {
                number: "1001".to_string(),
                name: "Alice".to_string(),
                email: None,
                password_hash: "x".to_string(),
                password_salt: "tandem".to_string(),
                allow_external: true,
                voicemail_pin_hash: None,
                voicemail_pin_salt: None,
                ad_synced: false,
                ad_username: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let registry = ExtensionRegistry::new();
        registry.register("9999", addr(5060), None, None, None, 3600);

        let store: Arc<dyn PbxStore> = Arc::new(store);
        let count = registry.reload(&store).await.unwrap();
        assert_eq!(count, 1);
        assert!(registry.lookup("1001").is_some());
        assert!(registry.lookup("9999").is_none());
        // Transient registrations are gone; phones must re-REGISTER
        assert!(!registry.is_registered("9999"));
    }
}
