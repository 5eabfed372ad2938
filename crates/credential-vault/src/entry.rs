use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version string written into every serialized document.
pub const DOCUMENT_VERSION: &str = "1.0";

/// Credentials for one service, keyed by identifier.
pub type ServiceCredentials = BTreeMap<String, CredentialEntry>;

/// One stored secret, unique per `(service, identifier)`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub service: String,
    pub identifier: String,
    /// Arbitrary JSON payload, e.g. `{"password": "..."}`.
    pub secret: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl CredentialEntry {
    pub fn new(
        service: impl Into<String>,
        identifier: impl Into<String>,
        secret: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service: service.into(),
            identifier: identifier.into(),
            secret,
            created_at: now,
            modified_at: now,
            access_count: 0,
            last_accessed_at: None,
        }
    }
}

impl std::fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("service", &self.service)
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("modified_at", &self.modified_at)
            .field("access_count", &self.access_count)
            .field("last_accessed_at", &self.last_accessed_at)
            .finish()
    }
}

/// Bookkeeping persisted alongside the credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultMetadata {
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    /// Successful unlocks since creation.
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub last_unlocked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub password_changed_at: Option<DateTime<Utc>>,
}

/// The plaintext that is encrypted into the vault file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultDocument {
    pub version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub credentials: BTreeMap<String, ServiceCredentials>,
    #[serde(default)]
    pub metadata: VaultMetadata,
}

impl VaultDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            created_at: now,
            credentials: BTreeMap::new(),
            metadata: VaultMetadata {
                last_modified: Some(now),
                ..VaultMetadata::default()
            },
        }
    }

    pub fn service_count(&self) -> usize {
        self.credentials.len()
    }

    pub fn total_credentials(&self) -> usize {
        self.credentials.values().map(BTreeMap::len).sum()
    }

    /// Insert or replace an entry. Replacing keeps `created_at` and the
    /// access bookkeeping of the previous entry.
    pub fn upsert(
        &mut self,
        service: &str,
        identifier: &str,
        secret: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let service_map = self.credentials.entry(service.to_string()).or_default();
        match service_map.get_mut(identifier) {
            Some(existing) => {
                existing.secret = secret;
                existing.modified_at = now;
            }
            None => {
                service_map.insert(
                    identifier.to_string(),
                    CredentialEntry::new(service, identifier, secret, now),
                );
            }
        }
        self.metadata.last_modified = Some(now);
    }

    /// Remove one identifier; an emptied service is removed as well.
    pub fn remove(&mut self, service: &str, identifier: &str) -> bool {
        let Some(service_map) = self.credentials.get_mut(service) else {
            return false;
        };
        let removed = service_map.remove(identifier).is_some();
        if service_map.is_empty() {
            self.credentials.remove(service);
        }
        removed
    }

    pub fn remove_service(&mut self, service: &str) -> bool {
        self.credentials.remove(service).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_redacts_secret() {
        let entry = CredentialEntry::new("mail", "me", json!({"password": "hunter2"}), Utc::now());
        let rendered = format!("{entry:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn upsert_keeps_creation_and_access_bookkeeping() {
        let t0 = Utc::now();
        let mut doc = VaultDocument::empty(t0);
        doc.upsert("mail", "me", json!({"v": 1}), t0);
        if let Some(entry) = doc.credentials.get_mut("mail").and_then(|s| s.get_mut("me")) {
            entry.access_count = 3;
        }

        let t1 = t0 + chrono::Duration::seconds(5);
        doc.upsert("mail", "me", json!({"v": 2}), t1);
        let entry = &doc.credentials["mail"]["me"];
        assert_eq!(entry.secret, json!({"v": 2}));
        assert_eq!(entry.created_at, t0);
        assert_eq!(entry.modified_at, t1);
        assert_eq!(entry.access_count, 3);
        assert_eq!(doc.total_credentials(), 1);
    }

    #[test]
    fn removing_last_identifier_removes_service() {
        let now = Utc::now();
        let mut doc = VaultDocument::empty(now);
        doc.upsert("mail", "a", json!(1), now);
        doc.upsert("mail", "b", json!(2), now);
        assert!(doc.remove("mail", "a"));
        assert_eq!(doc.service_count(), 1);
        assert!(doc.remove("mail", "b"));
        assert_eq!(doc.service_count(), 0);
        assert!(!doc.remove("mail", "b"));
        assert!(!doc.remove_service("mail"));
    }
}
