//! The persistence contract and its in-memory reference implementation
//!
//! The core talks to storage through [`PbxStore`] only. Deployments back
//! it with a relational store; tests and store-less installs use
//! [`MemoryStore`]. The phone-tracking methods carry the invariants the
//! registrar depends on: at most one row per (mac, extension) and per
//! (ip, extension), refreshes preserve `first_registered` and previously
//! learned fields, and re-provisioning a device to a new extension
//! removes the old rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// An extension identity as persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionRecord {
    /// Extension number, unique
    pub number: String,
    /// Display name
    pub name: String,
    pub email: Option<String>,
    /// Hex SHA-256 over salt and password
    pub password_hash: String,
    pub password_salt: String,
    /// Whether this extension may place external calls
    pub allow_external: bool,
    pub voicemail_pin_hash: Option<String>,
    pub voicemail_pin_salt: Option<String>,
    /// Set when the record is mirrored from a directory sync
    pub ad_synced: bool,
    pub ad_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked phone device registration row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoneRecord {
    pub mac: Option<String>,
    pub extension: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub first_registered: DateTime<Utc>,
    pub last_registered: DateTime<Utc>,
    pub contact_uri: Option<String>,
}

/// Input to a phone registration refresh
#[derive(Debug, Clone, Default)]
pub struct PhoneRegistration {
    pub extension: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub user_agent: Option<String>,
    pub contact_uri: Option<String>,
}

/// A call detail record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub call_id: String,
    pub from_extension: String,
    pub to_extension: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub status: String,
    pub recording_path: Option<String>,
}

/// The narrow persistence interface the core depends on
#[async_trait]
pub trait PbxStore: Send + Sync {
    /// All extension identities, for seeding the registry at boot and on
    /// reload.
    async fn load_extensions(&self) -> StoreResult<Vec<ExtensionRecord>>;

    /// One extension identity.
    async fn get_extension(&self, number: &str) -> StoreResult<Option<ExtensionRecord>>;

    /// Insert or replace an extension identity.
    async fn upsert_extension(&self, extension: ExtensionRecord) -> StoreResult<()>;

    /// Register or refresh a phone row.
    ///
    /// Contract: re-provisioning (same mac or ip appearing with a new
    /// extension) removes the stale rows; a refresh of an existing
    /// (mac, extension) or (ip, extension) row updates in place,
    /// preserving `first_registered` and any previously-learned field the
    /// refresh does not carry.
    async fn register_phone(&self, registration: PhoneRegistration) -> StoreResult<PhoneRecord>;

    /// Phone rows for one extension, most recent first.
    async fn phones_by_extension(&self, extension: &str) -> StoreResult<Vec<PhoneRecord>>;

    /// The phone row for a MAC, if tracked.
    async fn phone_by_mac(&self, mac: &str) -> StoreResult<Option<PhoneRecord>>;

    /// All phone rows.
    async fn list_phones(&self) -> StoreResult<Vec<PhoneRecord>>;

    /// Delete every phone row (server boot purges stale registrations).
    async fn clear_phones(&self) -> StoreResult<usize>;

    /// Delete rows whose mac or ip is missing; these are incomplete
    /// leftovers that can never match a refresh.
    async fn remove_incomplete_phones(&self) -> StoreResult<usize>;

    /// Open a call detail record.
    async fn insert_call_record(&self, record: CallRecord) -> StoreResult<()>;

    /// Close a call detail record.
    async fn close_call_record(
        &self,
        call_id: &str,
        end: DateTime<Utc>,
        duration_seconds: i64,
        status: &str,
        recording_path: Option<String>,
    ) -> StoreResult<()>;

    /// Persist a finished call's QoS summary (opaque to the store).
    async fn store_qos_summary(&self, call_id: &str, summary: serde_json::Value)
        -> StoreResult<()>;
}

/// In-memory [`PbxStore`] for tests and store-less deployments.
///
/// `fail_writes` simulates a transiently unavailable backend so the
/// degradation paths can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    extensions: Mutex<HashMap<String, ExtensionRecord>>,
    phones: Mutex<Vec<PhoneRecord>>,
    call_records: Mutex<HashMap<String, CallRecord>>,
    qos_summaries: Mutex<Vec<(String, serde_json::Value)>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated write failure".to_string()))
        } else {
            Ok(())
        }
    }

    /// Persisted QoS summaries, for assertions.
    pub fn qos_summaries(&self) -> Vec<(String, serde_json::Value)> {
        self.qos_summaries.lock().clone()
    }

    /// A call record by id, for assertions.
    pub fn call_record(&self, call_id: &str) -> Option<CallRecord> {
        self.call_records.lock().get(call_id).cloned()
    }
}

#[async_trait]
impl PbxStore for MemoryStore {
    async fn load_extensions(&self) -> StoreResult<Vec<ExtensionRecord>> {
        Ok(self.extensions.lock().values().cloned().collect())
    }

    async fn get_extension(&self, number: &str) -> StoreResult<Option<ExtensionRecord>> {
        Ok(self.extensions.lock().get(number).cloned())
    }

    async fn upsert_extension(&self, extension: ExtensionRecord) -> StoreResult<()> {
        self.check_writable()?;
        self.extensions
            .lock()
            .insert(extension.number.clone(), extension);
        Ok(())
    }

    async fn register_phone(&self, registration: PhoneRegistration) -> StoreResult<PhoneRecord> {
        self.check_writable()?;
        let now = Utc::now();
        let mut phones = self.phones.lock();

        // Re-provisioning: this device (by mac or ip) now belongs to a
        // different extension, so stale mappings must go.
        phones.retain(|row| {
            let same_mac = registration.mac.is_some() && row.mac == registration.mac;
            let same_ip = registration.ip.is_some() && row.ip == registration.ip;
            !((same_mac || same_ip) && row.extension != registration.extension)
        });

        let existing = phones.iter_mut().find(|row| {
            row.extension == registration.extension
                && ((registration.mac.is_some() && row.mac == registration.mac)
                    || (registration.ip.is_some() && row.ip == registration.ip))
        });

        let record = match existing {
            Some(row) => {
                // Refresh in place; a field the phone did not send this
                // time keeps its previously-learned value.
                if registration.mac.is_some() {
                    row.mac = registration.mac.clone();
                }
                if registration.ip.is_some() {
                    row.ip = registration.ip.clone();
                }
                if registration.user_agent.is_some() {
                    row.user_agent = registration.user_agent.clone();
                }
                if registration.contact_uri.is_some() {
                    row.contact_uri = registration.contact_uri.clone();
                }
                row.last_registered = now;
                row.clone()
            }
            None => {
                let row = PhoneRecord {
                    mac: registration.mac.clone(),
                    extension: registration.extension.clone(),
                    user_agent: registration.user_agent.clone(),
                    ip: registration.ip.clone(),
                    first_registered: now,
                    last_registered: now,
                    contact_uri: registration.contact_uri.clone(),
                };
                phones.push(row.clone());
                row
            }
        };

        Ok(record)
    }

    async fn phones_by_extension(&self, extension: &str) -> StoreResult<Vec<PhoneRecord>> {
        let mut rows: Vec<PhoneRecord> = self
            .phones
            .lock()
            .iter()
            .filter(|row| row.extension == extension)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_registered.cmp(&a.last_registered));
        Ok(rows)
    }

    async fn phone_by_mac(&self, mac: &str) -> StoreResult<Option<PhoneRecord>> {
        Ok(self
            .phones
            .lock()
            .iter()
            .find(|row| row.mac.as_deref() == Some(mac))
            .cloned())
    }

    async fn list_phones(&self) -> StoreResult<Vec<PhoneRecord>> {
        Ok(self.phones.lock().clone())
    }

    async fn clear_phones(&self) -> StoreResult<usize> {
        self.check_writable()?;
        let mut phones = self.phones.lock();
        let count = phones.len();
        phones.clear();
        Ok(count)
    }

    async fn remove_incomplete_phones(&self) -> StoreResult<usize> {
        self.check_writable()?;
        let mut phones = self.phones.lock();
        let before = phones.len();
        phones.retain(|row| row.mac.is_some() && row.ip.is_some());
        Ok(before - phones.len())
    }

    async fn insert_call_record(&self, record: CallRecord) -> StoreResult<()> {
        self.check_writable()?;
        self.call_records
            .lock()
            .insert(record.call_id.clone(), record);
        Ok(())
    }

    async fn close_call_record(
        &self,
        call_id: &str,
        end: DateTime<Utc>,
        duration_seconds: i64,
        status: &str,
        recording_path: Option<String>,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut records = self.call_records.lock();
        let record = records
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        record.end = Some(end);
        record.duration_seconds = Some(duration_seconds);
        record.status = status.to_string();
        if recording_path.is_some() {
            record.recording_path = recording_path;
        }
        Ok(())
    }

    async fn store_qos_summary(
        &self,
        call_id: &str,
        summary: serde_json::Value,
    ) -> StoreResult<()> {
        self.check_writable()?;
        self.qos_summaries
            .lock()
            .push((call_id.to_string(), summary));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(ext: &str, ip: &str, mac: Option<&str>) -> PhoneRegistration {
        PhoneRegistration {
            extension: ext.to_string(),
            ip: Some(ip.to_string()),
            mac: mac.map(str::to_string),
            user_agent: Some("Yealink SIP-T46S".to_string()),
            contact_uri: Some(format!("sip:{ext}@{ip}")),
        }
    }

    #[tokio::test]
    async fn refresh_keeps_one_row_and_first_registered() {
        let store = MemoryStore::new();
        let first = store
            .register_phone(registration("1001", "10.0.0.5", Some("001122334455")))
            .await
            .unwrap();

        for _ in 0..3 {
            store
                .register_phone(registration("1001", "10.0.0.5", Some("001122334455")))
                .await
                .unwrap();
        }

        let rows = store.phones_by_extension("1001").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_registered, first.first_registered);
        assert!(rows[0].last_registered >= first.last_registered);
    }

    #[tokio::test]
    async fn refresh_without_mac_preserves_learned_mac() {
        let store = MemoryStore::new();
        store
            .register_phone(registration("1001", "10.0.0.5", Some("001122334455")))
            .await
            .unwrap();

        // Later REGISTER lacks the MAC header
        store
            .register_phone(registration("1001", "10.0.0.5", None))
            .await
            .unwrap();

        let row = store.phone_by_mac("001122334455").await.unwrap().unwrap();
        assert_eq!(row.extension, "1001");
    }

    #[tokio::test]
    async fn reprovisioning_removes_old_extension_mapping() {
        let store = MemoryStore::new();
        store
            .register_phone(registration("1001", "10.0.0.5", Some("aabbccddeeff")))
            .await
            .unwrap();

        // Same device re-registers as a different extension
        store
            .register_phone(registration("1002", "10.0.0.5", Some("aabbccddeeff")))
            .await
            .unwrap();

        assert!(store.phones_by_extension("1001").await.unwrap().is_empty());
        let rows = store.phones_by_extension("1002").await.unwrap();
        assert_eq!(rows.len(), 1);

        let all = store.list_phones().await.unwrap();
        let mac_rows = all
            .iter()
            .filter(|r| r.mac.as_deref() == Some("aabbccddeeff"))
            .count();
        assert_eq!(mac_rows, 1, "duplicate rows after re-provisioning");
    }

    #[tokio::test]
    async fn reprovisioning_by_ip_only() {
        let store = MemoryStore::new();
        store.register_phone(registration("1001", "10.0.0.7", None)).await.unwrap();
        store.register_phone(registration("1003", "10.0.0.7", None)).await.unwrap();

        assert!(store.phones_by_extension("1001").await.unwrap().is_empty());
        assert_eq!(store.phones_by_extension("1003").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn boot_purge_clears_all_then_incomplete() {
        let store = MemoryStore::new();
        store.register_phone(registration("1001", "10.0.0.5", Some("aabbccddeeff"))).await.unwrap();
        store
            .register_phone(PhoneRegistration {
                extension: "1002".to_string(),
                ip: None,
                mac: Some("001122334455".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.clear_phones().await.unwrap(), 2);
        assert_eq!(store.remove_incomplete_phones().await.unwrap(), 0);
        assert!(store.list_phones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incomplete_rows_are_purged() {
        let store = MemoryStore::new();
        store
            .register_phone(PhoneRegistration {
                extension: "1002".to_string(),
                ip: None,
                mac: Some("001122334455".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        store.register_phone(registration("1001", "10.0.0.5", Some("aabbccddeeff"))).await.unwrap();

        assert_eq!(store.remove_incomplete_phones().await.unwrap(), 1);
        assert_eq!(store.list_phones().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_writes_surface_as_unavailable() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .register_phone(registration("1001", "10.0.0.5", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
