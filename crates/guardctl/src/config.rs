use std::path::{Path, PathBuf};

use audit_log::AuditLevel;
use policy_engine::{paths, CredentialsPolicy};
use tracing::warn;

/// Policy file to load: the explicit flag (clap already folds in
/// `PERSONAL_OS_PERMISSIONS`), else `<config dir>/permissions.yaml`.
pub fn resolve_policy_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => paths::permissions_path(),
    }
}

/// Vault file to open: the explicit flag, else the policy's `vault_file`.
pub fn resolve_vault_path(explicit: Option<&Path>, policy: &CredentialsPolicy) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| policy.vault_file.clone())
}

/// `tracing` filter directive for a policy `audit.log_level`.
///
/// Policy files use `DEBUG`/`INFO`/`WARNING`/`ERROR`/`CRITICAL`; unknown
/// names fall back to `info`.
pub fn log_filter_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

/// Minimum audit level for a policy `audit.log_level`.
pub fn audit_level(level: &str) -> AuditLevel {
    AuditLevel::parse(level).unwrap_or_else(|| {
        warn!(level, "unknown audit log level; using INFO");
        AuditLevel::Info
    })
}
