use std::path::PathBuf;

/// Failures surfaced by [`CredentialVault`](crate::CredentialVault).
///
/// None of the messages carry secret material.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault is locked")]
    Locked,

    /// Wrong master password, or the vault file is corrupted.
    #[error("unable to decrypt vault: wrong master password or corrupted data")]
    DecryptionFailed,

    #[error("too many failed unlock attempts; try again later")]
    LockedOut,

    #[error("panic mode is enabled; vault sessions are refused")]
    PanicMode,

    #[error("vault I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize vault contents: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vault cryptography error: {0}")]
    Crypto(String),

    /// The blocking task running a vault operation panicked or was cancelled.
    #[error("vault task failed: {0}")]
    Task(String),
}

impl VaultError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
