//! Encrypted at-rest store for service credentials.
//!
//! The vault is a `Locked ⇄ Unlocked` state machine over one file. Unlocking
//! derives an AES-256 key from the master password with PBKDF2-SHA256 and
//! the salt stored in the file header; the credential map only exists in
//! memory while unlocked, and is dropped (key wiped) on lock or after the
//! idle timeout.
//!
//! Every mutation, including the access bookkeeping done by
//! [`CredentialVault::retrieve_credential`], re-encrypts the whole map and
//! atomically replaces the file.
//!
//! ```rust,no_run
//! use credential_vault::{CredentialVault, VaultConfig};
//!
//! # fn example() -> Result<(), credential_vault::VaultError> {
//! let vault = CredentialVault::new(VaultConfig::new("/tmp/personal-os/vault.enc"));
//! vault.unlock("master password")?;
//! vault.store_credential("mail", "me@example.com", serde_json::json!({"password": "..."}))?;
//! vault.lock_vault();
//! # Ok(())
//! # }
//! ```

mod entry;
pub mod envelope;
mod error;
mod vault;

pub use entry::{CredentialEntry, ServiceCredentials, VaultDocument, VaultMetadata};
pub use error::VaultError;
pub use vault::{CredentialVault, VaultConfig, VaultStats, LOCKOUT_IDENTIFIER};
