use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::matcher::compile_patterns;
use crate::paths::Substitutions;
use crate::schema::{PolicyConfig, MAX_LOCKOUT_DURATION_SECS};

/// Load a [`PolicyConfig`] from a YAML file on disk.
///
/// Placeholders are expanded against the current environment and the
/// result is validated.
pub fn load_policy(path: impl AsRef<Path>) -> Result<PolicyConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    load_policy_from_str(&contents)
        .with_context(|| format!("failed to parse policy file: {}", path.display()))
}

/// Parse, expand and validate a [`PolicyConfig`] from a YAML string.
pub fn load_policy_from_str(yaml: &str) -> Result<PolicyConfig> {
    load_policy_with(yaml, &Substitutions::from_environment())
}

/// Like [`load_policy_from_str`] with explicit placeholder values.
pub fn load_policy_with(yaml: &str, subs: &Substitutions) -> Result<PolicyConfig> {
    let config: PolicyConfig = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    let config = expand_placeholders(config, subs);
    validate(&config)?;
    Ok(config)
}

/// The restrictive fallback with placeholders expanded.
pub fn default_policy(subs: &Substitutions) -> PolicyConfig {
    expand_placeholders(PolicyConfig::restrictive_default(), subs)
}

/// Expand `${TOKEN}` placeholders in every path-bearing field.
pub fn expand_placeholders(mut config: PolicyConfig, subs: &Substitutions) -> PolicyConfig {
    let fa = &mut config.file_access;
    for pattern in fa.allowed_paths.iter_mut().chain(fa.blocked_paths.iter_mut()) {
        *pattern = subs.expand(pattern);
    }
    config.audit.log_file = subs.expand_path(&config.audit.log_file);
    config.credentials.vault_file = subs.expand_path(&config.credentials.vault_file);
    config
}

/// Run post-deserialization validation checks.
fn validate(config: &PolicyConfig) -> Result<()> {
    if config.version != "1.0" {
        bail!(
            "unsupported policy version '{}'; only '1.0' is supported",
            config.version
        );
    }

    compile_patterns(&config.file_access.allowed_paths)
        .context("invalid file_access.allowed_paths")?;
    compile_patterns(&config.file_access.blocked_paths)
        .context("invalid file_access.blocked_paths")?;

    for ext in &config.file_access.sensitive_extensions {
        if !ext.starts_with('.') || ext.len() < 2 {
            bail!("sensitive extension '{ext}' must start with '.'");
        }
    }

    for domain in &config.web_access.allowed_domains {
        if domain.trim().is_empty() || domain.contains(char::is_whitespace) {
            bail!("invalid allowed domain: '{domain}'");
        }
    }

    for (action, limit) in &config.web_access.rate_limits {
        if *limit == 0 {
            bail!("rate limit for action '{action}' must be greater than zero");
        }
    }

    if config.emergency.max_failed_attempts == 0 {
        bail!("emergency.max_failed_attempts must be greater than zero");
    }
    if config.emergency.lockout_duration == 0 {
        bail!("emergency.lockout_duration must be greater than zero");
    }
    if config.emergency.lockout_duration > MAX_LOCKOUT_DURATION_SECS {
        bail!(
            "emergency.lockout_duration must be at most {MAX_LOCKOUT_DURATION_SECS} seconds, got {}",
            config.emergency.lockout_duration
        );
    }

    let sandbox = &config.sandbox;
    if sandbox.execution_timeout == 0 {
        bail!("sandbox.execution_timeout must be greater than zero");
    }
    if sandbox.max_memory_mb == 0 || sandbox.max_cpu_seconds == 0 || sandbox.max_file_size_mb == 0 {
        bail!("sandbox resource ceilings must be greater than zero");
    }

    if audit_log::AuditLevel::parse(&config.audit.log_level).is_none() {
        bail!("unknown audit.log_level '{}'", config.audit.log_level);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs() -> Substitutions {
        let mut s = Substitutions::default();
        s.insert("HOME", "/home/u");
        s.insert("APP_HOME", "/data/pos");
        s.insert("VAULT_FILE", "/data/pos/security/vault.enc");
        s.insert("AUDIT_LOG", "/data/pos/logs/audit.jsonl");
        s
    }

    #[test]
    fn load_minimal_policy() {
        let config = load_policy_with("version: \"1.0\"\n", &subs()).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(
            config.credentials.vault_file,
            std::path::PathBuf::from("/data/pos/security/vault.enc")
        );
        assert_eq!(
            config.audit.log_file,
            std::path::PathBuf::from("/data/pos/logs/audit.jsonl")
        );
    }

    #[test]
    fn placeholders_are_expanded_in_patterns() {
        let yaml = r#"
file_access:
  allowed_paths: ["${APP_HOME}/"]
  blocked_paths: ["${HOME}/.ssh/"]
"#;
        let config = load_policy_with(yaml, &subs()).unwrap();
        assert_eq!(config.file_access.allowed_paths, vec!["/data/pos/"]);
        assert_eq!(config.file_access.blocked_paths, vec!["/home/u/.ssh/"]);
    }

    #[test]
    fn reject_wrong_version() {
        let err = load_policy_with("version: \"2.0\"\n", &subs()).unwrap_err();
        assert!(
            err.to_string().contains("unsupported policy version"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn reject_zero_rate_limit() {
        let yaml = r#"
web_access:
  rate_limits:
    send_email: 0
"#;
        let err = load_policy_with(yaml, &subs()).unwrap_err();
        assert!(
            err.to_string().contains("must be greater than zero"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn reject_oversized_lockout_duration() {
        let yaml = r#"
emergency:
  max_failed_attempts: 3
  lockout_duration: 100000000000000
"#;
        let err = load_policy_with(yaml, &subs()).unwrap_err();
        assert!(
            err.to_string().contains("lockout_duration must be at most"),
            "unexpected error: {err}"
        );

        let yaml = format!("emergency:\n  lockout_duration: {MAX_LOCKOUT_DURATION_SECS}\n");
        assert!(load_policy_with(&yaml, &subs()).is_ok());
    }

    #[test]
    fn reject_invalid_glob() {
        let yaml = r#"
file_access:
  blocked_paths: ["/**/[oops"]
"#;
        let err = load_policy_with(yaml, &subs()).unwrap_err();
        assert!(
            format!("{err:#}").contains("blocked_paths"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn reject_unknown_log_level() {
        let yaml = r#"
audit:
  log_level: LOUD
"#;
        assert!(load_policy_with(yaml, &subs()).is_err());
    }

    #[test]
    fn reject_malformed_yaml() {
        let err = load_policy_with("file_access: [unclosed", &subs()).unwrap_err();
        assert!(
            err.to_string().contains("YAML deserialization failed"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_from_nonexistent_file() {
        let err = load_policy("/does/not/exist.yaml").unwrap_err();
        assert!(
            err.to_string().contains("failed to read policy file"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn default_policy_is_expanded_and_valid() {
        let config = default_policy(&subs());
        assert!(config
            .file_access
            .blocked_paths
            .contains(&"/home/u/.ssh/".to_string()));
        assert!(validate(&config).is_ok());
    }
}
