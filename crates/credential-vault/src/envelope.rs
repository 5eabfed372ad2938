//! On-disk vault format.
//!
//! The vault is a single JSON file holding the KDF parameters (including the
//! salt), the AES-256-GCM nonce and the ciphertext. The header fields are
//! bound to the ciphertext as associated data, so tampering with the salt or
//! iteration count fails authentication just like a wrong password.
//!
//! Every write replaces the whole file atomically: temp file in the same
//! directory, owner-only permissions, fsync, rename.

use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::VaultError;

pub const FORMAT_VERSION: u32 = 1;
pub const KDF_ALGORITHM: &str = "pbkdf2-sha256";
pub const CIPHER: &str = "aes-256-gcm";
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
/// Iteration counts accepted from a vault header or a [`VaultConfig`].
///
/// [`VaultConfig`]: crate::VaultConfig
pub const KDF_ITERATION_RANGE: std::ops::RangeInclusive<u32> = 1_000..=10_000_000;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A derived encryption key, wiped from memory on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    /// Base64 salt.
    pub salt: String,
}

/// The serialized vault file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub format_version: u32,
    pub kdf: KdfParams,
    pub cipher: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Key material recovered by a successful [`Envelope::open`].
pub struct Opened {
    pub key: DerivedKey,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub plaintext: Zeroizing<Vec<u8>>,
}

pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> DerivedKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    key
}

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

impl Envelope {
    /// Encrypt `plaintext` under `key` with a fresh nonce.
    pub fn seal(
        key: &DerivedKey,
        salt: &[u8],
        iterations: u32,
        plaintext: &[u8],
    ) -> Result<Self, VaultError> {
        let kdf = KdfParams {
            algorithm: KDF_ALGORITHM.to_string(),
            iterations,
            salt: BASE64.encode(salt),
        };
        let aad = associated_data(FORMAT_VERSION, &kdf, CIPHER);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Crypto("encryption failed".to_string()))?;

        Ok(Self {
            format_version: FORMAT_VERSION,
            kdf,
            cipher: CIPHER.to_string(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Derive the key from `password` and authenticate-decrypt.
    ///
    /// A malformed header is treated like a wrong password: both report
    /// [`VaultError::DecryptionFailed`].
    pub fn open(&self, password: &str) -> Result<Opened, VaultError> {
        self.check_header()?;

        let salt = decode(&self.kdf.salt)?;
        let nonce = decode(&self.nonce)?;
        let ciphertext = decode(&self.ciphertext)?;
        if nonce.len() != NONCE_LEN {
            return Err(VaultError::DecryptionFailed);
        }

        let key = derive_key(password, &salt, self.kdf.iterations);
        let aad = associated_data(self.format_version, &self.kdf, &self.cipher);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| VaultError::DecryptionFailed)?;

        Ok(Opened {
            key,
            salt,
            iterations: self.kdf.iterations,
            plaintext: Zeroizing::new(plaintext),
        })
    }

    /// Reject headers this build cannot open, including iteration counts
    /// outside [`KDF_ITERATION_RANGE`], before any key is derived.
    pub fn check_header(&self) -> Result<(), VaultError> {
        if self.format_version != FORMAT_VERSION
            || self.kdf.algorithm != KDF_ALGORITHM
            || self.cipher != CIPHER
            || !KDF_ITERATION_RANGE.contains(&self.kdf.iterations)
        {
            tracing::warn!(
                format_version = self.format_version,
                kdf = %self.kdf.algorithm,
                iterations = self.kdf.iterations,
                cipher = %self.cipher,
                "unsupported vault envelope"
            );
            return Err(VaultError::DecryptionFailed);
        }
        Ok(())
    }

    /// Read the envelope at `path`; `Ok(None)` when no vault exists yet.
    pub fn read(path: &Path) -> Result<Option<Self>, VaultError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::io(path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "vault file is not a valid envelope");
                Err(VaultError::DecryptionFailed)
            }
        }
    }

    /// Replace the file at `path` atomically with owner-only permissions.
    pub fn write_atomic(&self, path: &Path) -> Result<(), VaultError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| VaultError::io(dir, e))?;

        let bytes = serde_json::to_vec_pretty(self)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| VaultError::io(dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| VaultError::io(temp.path(), e))?;
        }
        temp.as_file_mut()
            .write_all(&bytes)
            .map_err(|e| VaultError::io(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| VaultError::io(temp.path(), e))?;
        temp.persist(path)
            .map_err(|e| VaultError::io(path, e.error))?;

        // Make the rename itself durable.
        #[cfg(unix)]
        if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
            tracing::warn!(dir = %dir.display(), error = %e, "could not fsync vault directory");
        }
        Ok(())
    }
}

fn associated_data(format_version: u32, kdf: &KdfParams, cipher: &str) -> String {
    format!(
        "personal-os-vault|{format_version}|{}|{}|{}|{cipher}",
        kdf.algorithm, kdf.iterations, kdf.salt
    )
}

fn decode(field: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(field)
        .map_err(|_| VaultError::DecryptionFailed)
}
