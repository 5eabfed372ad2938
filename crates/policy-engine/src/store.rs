use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::loader;
use crate::matcher::{compile_patterns, PathPattern};
use crate::paths::Substitutions;
use crate::schema::PolicyConfig;

/// Where the active snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    File(PathBuf),
    Inline,
    /// The restrictive default replaced a missing or malformed source.
    Fallback { reason: String },
}

/// An immutable, pre-compiled view of one policy configuration.
#[derive(Debug)]
pub struct PolicySnapshot {
    config: PolicyConfig,
    allowed: Vec<PathPattern>,
    blocked: Vec<PathPattern>,
    source: PolicySource,
}

impl PolicySnapshot {
    /// Compile the path patterns of an already-expanded configuration.
    pub fn compile(config: PolicyConfig, source: PolicySource) -> Result<Self> {
        let allowed = compile_patterns(&config.file_access.allowed_paths)
            .context("failed to compile allowed paths")?;
        let blocked = compile_patterns(&config.file_access.blocked_paths)
            .context("failed to compile blocked paths")?;
        Ok(Self {
            config,
            allowed,
            blocked,
            source,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn allowed_patterns(&self) -> &[PathPattern] {
        &self.allowed
    }

    pub fn blocked_patterns(&self) -> &[PathPattern] {
        &self.blocked
    }

    pub fn source(&self) -> &PolicySource {
        &self.source
    }
}

/// Holds the current policy snapshot. Reload replaces the whole snapshot;
/// readers holding an older `Arc` keep a consistent view.
#[derive(Debug)]
pub struct PolicyStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// Load from `path`, substituting the restrictive default when the file
    /// is missing or malformed. Never fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let snapshot = match Self::load_snapshot(&path) {
            Ok(snapshot) => {
                info!(path = %path.display(), "policy loaded");
                snapshot
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "policy unusable; falling back to restrictive default"
                );
                Self::fallback_snapshot(format!("{err:#}"))
            }
        };
        Self {
            path: Some(path),
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Build a store from an in-memory configuration (placeholders are
    /// expected to be expanded already).
    pub fn from_config(config: PolicyConfig) -> Result<Self> {
        let snapshot = PolicySnapshot::compile(config, PolicySource::Inline)?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// A store holding only the restrictive default.
    pub fn restrictive_default() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(Self::fallback_snapshot(
                "no policy source configured".to_string(),
            ))),
        }
    }

    /// Cheap clone of the current snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Why the restrictive default is active, if it is.
    pub fn fallback_reason(&self) -> Option<String> {
        match self.snapshot().source() {
            PolicySource::Fallback { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Re-read the source file and replace the snapshot wholesale.
    ///
    /// On error the previous snapshot stays active.
    pub fn reload(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .context("policy store has no source file to reload")?;
        let snapshot = Self::load_snapshot(path)?;
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
        info!(path = %path.display(), "policy reloaded");
        Ok(())
    }

    fn load_snapshot(path: &Path) -> Result<PolicySnapshot> {
        let config = loader::load_policy(path)?;
        PolicySnapshot::compile(config, PolicySource::File(path.to_path_buf()))
    }

    fn fallback_snapshot(reason: String) -> PolicySnapshot {
        let config = loader::default_policy(&Substitutions::from_environment());
        let source = PolicySource::Fallback { reason };
        match PolicySnapshot::compile(config, source.clone()) {
            Ok(snapshot) => snapshot,
            // Only reachable if an expanded placeholder produced an invalid
            // glob; deny all file access rather than fail.
            Err(err) => {
                warn!(error = %err, "restrictive default failed to compile; file access disabled");
                let mut config = PolicyConfig::restrictive_default();
                config.file_access.allowed_paths.clear();
                config.file_access.blocked_paths.clear();
                PolicySnapshot {
                    config,
                    allowed: Vec::new(),
                    blocked: Vec::new(),
                    source,
                }
            }
        }
    }
}
