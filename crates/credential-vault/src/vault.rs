use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use chrono::{DateTime, Utc};
use policy_engine::{CredentialsPolicy, PolicyEngine};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::entry::{CredentialEntry, ServiceCredentials, VaultDocument};
use crate::envelope::{
    derive_key, generate_salt, DerivedKey, Envelope, DEFAULT_KDF_ITERATIONS, KDF_ITERATION_RANGE,
};
use crate::error::VaultError;

/// Audit component name for entries raised by the vault.
const COMPONENT: &str = "credential-vault";

/// Identifier used with the policy engine's failed-attempt tracking.
pub const LOCKOUT_IDENTIFIER: &str = "vault";

/// Where the vault lives and how it behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    pub path: PathBuf,
    /// Idle time after which an unlocked vault locks itself. Zero disables.
    pub auto_lock_timeout: Duration,
    /// PBKDF2 rounds used when creating the vault or changing the password.
    /// Existing vaults are opened with the count stored in their header.
    pub kdf_iterations: u32,
}

impl VaultConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            auto_lock_timeout: Duration::from_secs(1800),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    pub fn from_policy(policy: &CredentialsPolicy) -> Self {
        Self::new(policy.vault_file.clone())
            .with_auto_lock_timeout(Duration::from_secs(policy.auto_lock_timeout))
    }

    pub fn with_auto_lock_timeout(mut self, timeout: Duration) -> Self {
        self.auto_lock_timeout = timeout;
        self
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations =
            iterations.clamp(*KDF_ITERATION_RANGE.start(), *KDF_ITERATION_RANGE.end());
        self
    }
}

/// Summary safe to show anywhere: never contains secret payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum VaultStats {
    Locked,
    Unlocked {
        services: usize,
        total_credentials: usize,
        last_access: DateTime<Utc>,
        /// Seconds.
        auto_lock_timeout: u64,
    },
}

/// Key material and plaintext exist only inside this variant.
enum VaultState {
    Locked,
    Unlocked(UnlockedVault),
}

struct UnlockedVault {
    key: DerivedKey,
    salt: Vec<u8>,
    iterations: u32,
    document: VaultDocument,
    last_activity: Instant,
    last_access_at: DateTime<Utc>,
}

impl UnlockedVault {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_access_at = Utc::now();
    }

    fn seal(&self, document: &VaultDocument) -> Result<Envelope, VaultError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(document)?);
        Envelope::seal(&self.key, &self.salt, self.iterations, &plaintext)
    }
}

/// Password-locked credential store persisted as one encrypted envelope.
///
/// Every public operation first enforces auto-lock. All state sits behind a
/// single mutex; operations do synchronous file I/O and key derivation, so
/// async callers should go through [`CredentialVault::blocking`].
pub struct CredentialVault {
    config: VaultConfig,
    state: Mutex<VaultState>,
    engine: Option<Arc<PolicyEngine>>,
    audit: AuditSink,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let locked = matches!(*self.lock_state(), VaultState::Locked);
        f.debug_struct("CredentialVault")
            .field("path", &self.config.path)
            .field("locked", &locked)
            .field("policy_engine", &self.engine.is_some())
            .finish()
    }
}

impl CredentialVault {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            state: Mutex::new(VaultState::Locked),
            engine: None,
            audit: AuditSink::disabled(),
        }
    }

    /// Gate unlocks on panic mode and lockout, and audit through the
    /// engine's sink.
    pub fn with_policy_engine(mut self, engine: Arc<PolicyEngine>) -> Self {
        self.audit = engine.audit().clone();
        self.engine = Some(engine);
        self
    }

    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = audit;
        self
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn exists(&self) -> bool {
        self.config.path.exists()
    }

    /// Run a vault operation on tokio's blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, VaultError>
    where
        F: FnOnce(&CredentialVault) -> Result<T, VaultError> + Send + 'static,
        T: Send + 'static,
    {
        let vault = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&vault))
            .await
            .map_err(|e| VaultError::Task(e.to_string()))?
    }

    // -- lock state ---------------------------------------------------------

    /// Create the vault on first use, otherwise decrypt it.
    ///
    /// Any existing session is discarded first, so a failed unlock always
    /// leaves the vault locked.
    pub fn unlock(&self, master_password: &str) -> Result<(), VaultError> {
        if let Some(engine) = &self.engine {
            if engine.is_panic_mode() {
                warn!("vault unlock refused: panic mode");
                self.emit(AuditEventType::PanicModeRefusal, json!({ "operation": "unlock" }));
                return Err(VaultError::PanicMode);
            }
            if engine.is_locked_out(LOCKOUT_IDENTIFIER) {
                warn!("vault unlock refused: locked out");
                return Err(VaultError::LockedOut);
            }
        }

        let mut state = self.lock_state();
        *state = VaultState::Locked;

        let Some(envelope) = Envelope::read(&self.config.path)? else {
            let unlocked = self.create(master_password)?;
            *state = VaultState::Unlocked(unlocked);
            return Ok(());
        };

        // A damaged header is not a password guess; it is not counted.
        envelope.check_header()?;
        let opened = match envelope.open(master_password) {
            Ok(opened) => opened,
            Err(VaultError::DecryptionFailed) => {
                self.record_failure();
                return Err(VaultError::DecryptionFailed);
            }
            Err(other) => return Err(other),
        };

        let mut document: VaultDocument = serde_json::from_slice(&opened.plaintext)?;
        let now = Utc::now();
        document.metadata.access_count += 1;
        document.metadata.last_unlocked_at = Some(now);

        let unlocked = UnlockedVault {
            key: opened.key,
            salt: opened.salt,
            iterations: opened.iterations,
            document,
            last_activity: Instant::now(),
            last_access_at: now,
        };
        unlocked
            .seal(&unlocked.document)?
            .write_atomic(&self.config.path)?;

        if let Some(engine) = &self.engine {
            engine.clear_failed_attempts(LOCKOUT_IDENTIFIER);
        }
        info!(
            services = unlocked.document.service_count(),
            "credential vault unlocked"
        );
        self.emit(
            AuditEventType::VaultUnlocked,
            json!({
                "services": unlocked.document.service_count(),
                "unlock_count": unlocked.document.metadata.access_count,
            }),
        );
        *state = VaultState::Unlocked(unlocked);
        Ok(())
    }

    /// Reports the lock state, locking the vault first if it has been idle
    /// longer than the auto-lock timeout.
    pub fn is_locked(&self) -> bool {
        let mut state = self.lock_state();
        self.enforce_auto_lock(&mut state)
    }

    /// Discard key material and plaintext. Idempotent.
    pub fn lock_vault(&self) {
        let mut state = self.lock_state();
        if let VaultState::Unlocked(_) = *state {
            *state = VaultState::Locked;
            info!("credential vault locked");
            self.emit(AuditEventType::VaultLocked, json!({ "reason": "explicit" }));
        }
    }

    /// Re-encrypt everything under a key derived from `new_password` with a
    /// fresh salt, in one atomic write.
    ///
    /// `current_password` is verified even when the vault is already
    /// unlocked.
    pub fn change_master_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), VaultError> {
        if self.is_locked() {
            self.unlock(current_password)?;
        }

        let mut state = self.lock_state();
        let unlocked = self.session(&mut state)?;

        let check = derive_key(current_password, &unlocked.salt, unlocked.iterations);
        if !keys_equal(&check, &unlocked.key) {
            drop(state);
            self.record_failure();
            return Err(VaultError::DecryptionFailed);
        }

        let salt = generate_salt();
        let iterations = self.config.kdf_iterations;
        let key = derive_key(new_password, &salt, iterations);

        let mut document = unlocked.document.clone();
        let now = Utc::now();
        document.metadata.password_changed_at = Some(now);
        document.metadata.last_modified = Some(now);

        let plaintext = Zeroizing::new(serde_json::to_vec(&document)?);
        Envelope::seal(&key, &salt, iterations, &plaintext)?.write_atomic(&self.config.path)?;

        unlocked.key = key;
        unlocked.salt = salt;
        unlocked.iterations = iterations;
        unlocked.document = document;
        unlocked.touch();

        info!("master password changed");
        self.emit(AuditEventType::MasterPasswordChanged, json!({}));
        Ok(())
    }

    // -- credentials --------------------------------------------------------

    /// Upsert and persist the whole vault.
    pub fn store_credential(
        &self,
        service: &str,
        identifier: &str,
        secret: serde_json::Value,
    ) -> Result<(), VaultError> {
        self.mutate(|document, now| {
            document.upsert(service, identifier, secret, now);
            Ok(())
        })?;
        info!(service, identifier, "credential stored");
        self.emit(
            AuditEventType::CredentialStored,
            json!({ "service": service, "identifier": identifier }),
        );
        Ok(())
    }

    /// Fetch one entry. A hit bumps its access bookkeeping, which rewrites
    /// the vault file.
    pub fn retrieve_credential(
        &self,
        service: &str,
        identifier: &str,
    ) -> Result<Option<CredentialEntry>, VaultError> {
        let found = self.mutate(|document, now| {
            let Some(entry) = document
                .credentials
                .get_mut(service)
                .and_then(|s| s.get_mut(identifier))
            else {
                return Ok(None);
            };
            entry.access_count += 1;
            entry.last_accessed_at = Some(now);
            Ok(Some(entry.clone()))
        })?;

        match &found {
            Some(entry) => {
                debug!(service, identifier, access_count = entry.access_count, "credential retrieved");
                self.emit(
                    AuditEventType::CredentialRetrieved,
                    json!({
                        "service": service,
                        "identifier": identifier,
                        "access_count": entry.access_count,
                    }),
                );
            }
            None => debug!(service, identifier, "credential not found"),
        }
        Ok(found)
    }

    /// All entries for `service`. Does not change access bookkeeping.
    pub fn retrieve_service(&self, service: &str) -> Result<Option<ServiceCredentials>, VaultError> {
        let mut state = self.lock_state();
        let unlocked = self.session(&mut state)?;
        unlocked.touch();
        Ok(unlocked.document.credentials.get(service).cloned())
    }

    /// Remove one identifier. Returns `false` when nothing matched.
    pub fn delete_credential(&self, service: &str, identifier: &str) -> Result<bool, VaultError> {
        let removed = self.mutate(|document, now| {
            let removed = document.remove(service, identifier);
            if removed {
                document.metadata.last_modified = Some(now);
            }
            Ok(removed)
        })?;
        if removed {
            info!(service, identifier, "credential deleted");
            self.emit(
                AuditEventType::CredentialDeleted,
                json!({ "service": service, "identifier": identifier }),
            );
        }
        Ok(removed)
    }

    /// Remove every identifier of `service`.
    pub fn delete_service(&self, service: &str) -> Result<bool, VaultError> {
        let removed = self.mutate(|document, now| {
            let removed = document.remove_service(service);
            if removed {
                document.metadata.last_modified = Some(now);
            }
            Ok(removed)
        })?;
        if removed {
            info!(service, "service credentials deleted");
            self.emit(AuditEventType::CredentialDeleted, json!({ "service": service }));
        }
        Ok(removed)
    }

    /// Empty when locked.
    pub fn list_services(&self) -> Vec<String> {
        let mut state = self.lock_state();
        match self.session(&mut state) {
            Ok(unlocked) => unlocked.document.credentials.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Empty when locked or when the service is unknown.
    pub fn list_identifiers(&self, service: &str) -> Vec<String> {
        let mut state = self.lock_state();
        match self.session(&mut state) {
            Ok(unlocked) => unlocked
                .document
                .credentials
                .get(service)
                .map(|s| s.keys().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn get_vault_stats(&self) -> VaultStats {
        let mut state = self.lock_state();
        match self.session(&mut state) {
            Ok(unlocked) => VaultStats::Unlocked {
                services: unlocked.document.service_count(),
                total_credentials: unlocked.document.total_credentials(),
                last_access: unlocked.last_access_at,
                auto_lock_timeout: self.config.auto_lock_timeout.as_secs(),
            },
            Err(_) => VaultStats::Locked,
        }
    }

    // -- internals ----------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if the vault is (now) locked.
    fn enforce_auto_lock(&self, state: &mut VaultState) -> bool {
        let VaultState::Unlocked(unlocked) = state else {
            return true;
        };
        let timeout = self.config.auto_lock_timeout;
        if timeout.is_zero() || unlocked.last_activity.elapsed() <= timeout {
            return false;
        }
        *state = VaultState::Locked;
        info!(timeout_secs = timeout.as_secs(), "credential vault auto-locked");
        self.emit(
            AuditEventType::VaultAutoLocked,
            json!({ "idle_timeout_secs": timeout.as_secs() }),
        );
        true
    }

    /// The live session, after auto-lock enforcement.
    fn session<'a>(&self, state: &'a mut VaultState) -> Result<&'a mut UnlockedVault, VaultError> {
        if self.enforce_auto_lock(state) {
            return Err(VaultError::Locked);
        }
        match state {
            VaultState::Unlocked(unlocked) => Ok(unlocked),
            VaultState::Locked => Err(VaultError::Locked),
        }
    }

    /// Apply `op` to a copy of the document, persist it, then commit. A
    /// failed write leaves the in-memory state untouched.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut VaultDocument, DateTime<Utc>) -> Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        let mut state = self.lock_state();
        let unlocked = self.session(&mut state)?;
        unlocked.touch();

        let mut document = unlocked.document.clone();
        let out = op(&mut document, Utc::now())?;
        if document != unlocked.document {
            unlocked.seal(&document)?.write_atomic(&self.config.path)?;
            unlocked.document = document;
        }
        Ok(out)
    }

    fn create(&self, master_password: &str) -> Result<UnlockedVault, VaultError> {
        let salt = generate_salt();
        let iterations = self.config.kdf_iterations;
        let key = derive_key(master_password, &salt, iterations);
        let now = Utc::now();
        let unlocked = UnlockedVault {
            key,
            salt,
            iterations,
            document: VaultDocument::empty(now),
            last_activity: Instant::now(),
            last_access_at: now,
        };
        unlocked
            .seal(&unlocked.document)?
            .write_atomic(&self.config.path)?;

        info!(path = %self.config.path.display(), "created new credential vault");
        self.emit(
            AuditEventType::VaultCreated,
            json!({ "path": self.config.path.display().to_string() }),
        );
        Ok(unlocked)
    }

    fn record_failure(&self) {
        warn!("vault unlock failed");
        match &self.engine {
            // The engine audits the failure and any resulting lockout.
            Some(engine) => {
                if engine.record_failed_attempt(LOCKOUT_IDENTIFIER) {
                    warn!("vault locked out after repeated failures");
                }
            }
            None => self.emit(
                AuditEventType::FailedAuth,
                json!({ "identifier": LOCKOUT_IDENTIFIER }),
            ),
        }
    }

    fn emit(&self, event_type: AuditEventType, details: serde_json::Value) {
        self.audit
            .try_log(AuditEntry::new(event_type, AuditSource::new(COMPONENT), details));
    }
}

fn keys_equal(a: &DerivedKey, b: &DerivedKey) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::{loader, paths::Substitutions};
    use serde_json::json;

    fn config(dir: &tempfile::TempDir) -> VaultConfig {
        VaultConfig::new(dir.path().join("security").join("vault.enc"))
            .with_kdf_iterations(1_000)
            .with_auto_lock_timeout(Duration::ZERO)
    }

    fn vault(dir: &tempfile::TempDir) -> CredentialVault {
        CredentialVault::new(config(dir))
    }

    fn engine(yaml: &str) -> Arc<PolicyEngine> {
        let config = loader::load_policy_with(yaml, &Substitutions::default()).unwrap();
        Arc::new(PolicyEngine::from_config(config).unwrap())
    }

    #[test]
    fn starts_locked_and_first_unlock_creates() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        assert!(v.is_locked());
        assert!(!v.exists());
        v.unlock("pw").unwrap();
        assert!(!v.is_locked());
        assert!(v.exists());
    }

    #[test]
    fn store_and_retrieve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("pw").unwrap();
        v.store_credential("mail", "a", json!({"x": 1})).unwrap();

        let entry = v.retrieve_credential("mail", "a").unwrap().unwrap();
        assert_eq!(entry.secret, json!({"x": 1}));
        assert_eq!(entry.access_count, 1);
        assert!(entry.last_accessed_at.is_some());

        assert!(v.retrieve_credential("mail", "missing").unwrap().is_none());
        assert!(v.retrieve_credential("nope", "a").unwrap().is_none());
    }

    #[test]
    fn access_count_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("pw").unwrap();
        v.store_credential("mail", "a", json!("s")).unwrap();
        v.retrieve_credential("mail", "a").unwrap();
        v.retrieve_credential("mail", "a").unwrap();
        v.lock_vault();

        let reopened = vault(&dir);
        reopened.unlock("pw").unwrap();
        let services = reopened.retrieve_service("mail").unwrap().unwrap();
        assert_eq!(services["a"].access_count, 2);
    }

    #[test]
    fn locked_vault_refuses_operations() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("pw").unwrap();
        v.store_credential("mail", "a", json!({"x": 1})).unwrap();
        v.lock_vault();
        v.lock_vault();

        assert!(matches!(v.retrieve_credential("mail", "a"), Err(VaultError::Locked)));
        assert!(matches!(
            v.store_credential("mail", "b", json!(1)),
            Err(VaultError::Locked)
        ));
        assert!(matches!(v.delete_credential("mail", "a"), Err(VaultError::Locked)));
        assert!(v.list_services().is_empty());
        assert!(v.list_identifiers("mail").is_empty());
        assert_eq!(v.get_vault_stats(), VaultStats::Locked);
    }

    #[test]
    fn wrong_password_never_decrypts() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("correct").unwrap();
        v.store_credential("mail", "a", json!({"x": 1})).unwrap();
        v.lock_vault();

        assert!(matches!(v.unlock("wrong"), Err(VaultError::DecryptionFailed)));
        assert!(v.is_locked());

        v.unlock("correct").unwrap();
        let entry = v.retrieve_credential("mail", "a").unwrap().unwrap();
        assert_eq!(entry.secret, json!({"x": 1}));
    }

    #[test]
    fn failed_unlock_discards_open_session() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("correct").unwrap();
        assert!(v.unlock("wrong").is_err());
        assert!(v.is_locked());
    }

    #[test]
    fn auto_lock_after_idle_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let v = CredentialVault::new(
            config(&dir).with_auto_lock_timeout(Duration::from_millis(50)),
        );
        v.unlock("pw").unwrap();
        v.store_credential("mail", "a", json!(1)).unwrap();
        assert!(!v.is_locked());

        std::thread::sleep(Duration::from_millis(120));
        assert!(v.is_locked());
        assert!(matches!(v.retrieve_credential("mail", "a"), Err(VaultError::Locked)));
    }

    #[test]
    fn delete_identifier_and_service() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("pw").unwrap();
        v.store_credential("mail", "a", json!(1)).unwrap();
        v.store_credential("mail", "b", json!(2)).unwrap();
        v.store_credential("chat", "c", json!(3)).unwrap();

        assert_eq!(v.list_services(), vec!["chat", "mail"]);
        assert_eq!(v.list_identifiers("mail"), vec!["a", "b"]);

        assert!(v.delete_credential("mail", "a").unwrap());
        assert!(!v.delete_credential("mail", "a").unwrap());
        assert!(v.delete_credential("mail", "b").unwrap());
        assert_eq!(v.list_services(), vec!["chat"]);

        assert!(v.delete_service("chat").unwrap());
        assert!(!v.delete_service("chat").unwrap());
        assert!(v.list_services().is_empty());
    }

    #[test]
    fn stats_never_include_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("pw").unwrap();
        v.store_credential("mail", "a", json!({"password": "hunter2"})).unwrap();
        v.store_credential("mail", "b", json!({"password": "hunter3"})).unwrap();

        let stats = v.get_vault_stats();
        match &stats {
            VaultStats::Unlocked {
                services,
                total_credentials,
                auto_lock_timeout,
                ..
            } => {
                assert_eq!(*services, 1);
                assert_eq!(*total_credentials, 2);
                assert_eq!(*auto_lock_timeout, 0);
            }
            VaultStats::Locked => panic!("expected unlocked stats"),
        }
        let rendered = serde_json::to_string(&stats).unwrap();
        assert!(rendered.contains("\"status\":\"unlocked\""));
        assert!(!rendered.contains("hunter"));

        v.lock_vault();
        assert_eq!(
            serde_json::to_value(v.get_vault_stats()).unwrap(),
            json!({"status": "locked"})
        );
    }

    #[test]
    fn change_master_password() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("old").unwrap();
        v.store_credential("mail", "a", json!("s")).unwrap();

        assert!(matches!(
            v.change_master_password("not-old", "new"),
            Err(VaultError::DecryptionFailed)
        ));

        v.change_master_password("old", "new").unwrap();
        // Session stays usable under the new key.
        v.store_credential("mail", "b", json!("t")).unwrap();
        v.lock_vault();

        assert!(matches!(v.unlock("old"), Err(VaultError::DecryptionFailed)));
        v.unlock("new").unwrap();
        assert_eq!(v.list_identifiers("mail"), vec!["a", "b"]);
    }

    #[test]
    fn change_password_from_locked_state() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("old").unwrap();
        v.store_credential("mail", "a", json!("s")).unwrap();
        v.lock_vault();

        v.change_master_password("old", "new").unwrap();
        v.lock_vault();
        v.unlock("new").unwrap();
        assert_eq!(v.list_identifiers("mail"), vec!["a"]);
    }

    #[test]
    fn panic_mode_refuses_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir).with_policy_engine(engine("emergency:\n  panic_mode_enabled: true\n"));
        assert!(matches!(v.unlock("pw"), Err(VaultError::PanicMode)));
        assert!(!v.exists());
    }

    #[test]
    fn repeated_failures_lock_out_and_success_clears() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("emergency:\n  max_failed_attempts: 3\n  lockout_duration: 300\n");
        let v = vault(&dir).with_policy_engine(Arc::clone(&engine));
        v.unlock("correct").unwrap();
        v.lock_vault();

        for _ in 0..3 {
            assert!(matches!(v.unlock("wrong"), Err(VaultError::DecryptionFailed)));
        }
        assert!(matches!(v.unlock("correct"), Err(VaultError::LockedOut)));

        engine.clear_failed_attempts(LOCKOUT_IDENTIFIER);
        v.unlock("wrong").unwrap_err();
        v.unlock("correct").unwrap();
        assert!(!engine.is_locked_out(LOCKOUT_IDENTIFIER));
        v.lock_vault();
        v.unlock("wrong").unwrap_err();
        v.unlock("wrong").unwrap_err();
        // The earlier success cleared the record, so two more failures do
        // not reach the limit.
        v.unlock("correct").unwrap();
    }

    #[test]
    fn tampered_iteration_count_is_refused_without_counting() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("emergency:\n  max_failed_attempts: 2\n  lockout_duration: 300\n");
        let v = vault(&dir).with_policy_engine(Arc::clone(&engine));
        v.unlock("pw").unwrap();
        v.lock_vault();

        let mut envelope = Envelope::read(v.path()).unwrap().unwrap();
        envelope.kdf.iterations = u32::MAX;
        envelope.write_atomic(v.path()).unwrap();

        for _ in 0..3 {
            assert!(matches!(v.unlock("pw"), Err(VaultError::DecryptionFailed)));
        }
        assert!(v.is_locked());
        assert!(!engine.is_locked_out(LOCKOUT_IDENTIFIER));
    }

    #[test]
    fn configured_iterations_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config(&dir).with_kdf_iterations(1).kdf_iterations, 1_000);
        assert_eq!(
            config(&dir).with_kdf_iterations(u32::MAX).kdf_iterations,
            10_000_000
        );
    }

    #[test]
    fn corrupted_file_is_a_decryption_failure() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.unlock("pw").unwrap();
        v.lock_vault();
        std::fs::write(v.path(), b"{\"format_version\":1}").unwrap();
        assert!(matches!(v.unlock("pw"), Err(VaultError::DecryptionFailed)));
        assert!(v.is_locked());
    }

    #[tokio::test]
    async fn blocking_facade_runs_operations() {
        let dir = tempfile::tempdir().unwrap();
        let v = Arc::new(vault(&dir));
        v.blocking(|v| v.unlock("pw")).await.unwrap();
        v.blocking(|v| v.store_credential("mail", "a", json!(7)))
            .await
            .unwrap();
        let entry = v
            .blocking(|v| v.retrieve_credential("mail", "a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.secret, json!(7));
    }
}
