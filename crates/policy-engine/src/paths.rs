//! Well-known directories and `${TOKEN}` placeholder expansion for policy
//! files.
//!
//! Every location can be overridden through a `PERSONAL_OS_*` environment
//! variable so tests and packaged installs can relocate state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};

pub const ENV_PREFIX: &str = "PERSONAL_OS";

const APP_DIR_NAME: &str = "secure_personal_os";

fn env_path(suffix: &str) -> Option<PathBuf> {
    std::env::var_os(format!("{ENV_PREFIX}_{suffix}"))
        .filter(|v| !v.is_empty())
        .map(|v| expand_tilde(&PathBuf::from(v)))
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir)
}

/// Base application data directory (`PERSONAL_OS_HOME` overrides).
pub fn base_dir() -> PathBuf {
    env_path("HOME").unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| home_dir().join(".local").join("share"))
            .join(APP_DIR_NAME)
    })
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join(APP_DIR_NAME)
}

pub fn logs_dir() -> PathBuf {
    base_dir().join("logs")
}

pub fn security_dir() -> PathBuf {
    base_dir().join("security")
}

pub fn vault_path() -> PathBuf {
    env_path("VAULT").unwrap_or_else(|| security_dir().join("credential_vault.enc"))
}

pub fn audit_log_path() -> PathBuf {
    env_path("AUDIT_LOG").unwrap_or_else(|| logs_dir().join("audit.jsonl"))
}

/// Policy file location: `PERSONAL_OS_PERMISSIONS`, else
/// `<config dir>/permissions.yaml`.
pub fn permissions_path() -> PathBuf {
    env_path("PERMISSIONS").unwrap_or_else(|| config_dir().join("permissions.yaml"))
}

pub fn temp_dir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// Create the data, log and security directories if they are missing.
pub fn ensure_dirs() -> std::io::Result<()> {
    for dir in [base_dir(), config_dir(), logs_dir(), security_dir()] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// The `${TOKEN}` values available to policy files.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    values: BTreeMap<String, String>,
}

impl Substitutions {
    /// Resolve every token from the current process environment.
    pub fn from_environment() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let mut subs = Self::default();
        subs.insert("APP_HOME", base_dir());
        subs.insert("CONFIG_DIR", config_dir());
        subs.insert("LOGS_DIR", logs_dir());
        subs.insert("SECURITY_DIR", security_dir());
        subs.insert("VAULT_FILE", vault_path());
        subs.insert("AUDIT_LOG", audit_log_path());
        subs.insert("HOME", home_dir());
        subs.insert("TMPDIR", temp_dir());
        subs.insert("CWD", cwd);
        subs
    }

    pub fn insert(&mut self, token: &str, value: impl AsRef<Path>) {
        let value = value.as_ref().to_string_lossy();
        // Directory tokens are written as `${TOKEN}/...` in policies.
        let trimmed = if value.len() > 1 {
            value.trim_end_matches('/')
        } else {
            &value
        };
        self.values.insert(token.to_string(), trimmed.to_string());
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.values.get(token).map(String::as_str)
    }

    /// Expand `${TOKEN}` placeholders, then `$VAR` / `${VAR}` environment
    /// references, then a leading `~`. Unknown references are left as-is.
    pub fn expand(&self, value: &str) -> String {
        let Some(re) = placeholder_regex() else {
            return expand_tilde(Path::new(value)).to_string_lossy().into_owned();
        };
        let expanded = re.replace_all(value, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if let Some(v) = self.get(name) {
                return v.to_string();
            }
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        });
        expand_tilde(Path::new(expanded.as_ref()))
            .to_string_lossy()
            .into_owned()
    }

    pub fn expand_path(&self, path: &Path) -> PathBuf {
        PathBuf::from(self.expand(&path.to_string_lossy()))
    }
}

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").ok()
    })
    .as_ref()
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
