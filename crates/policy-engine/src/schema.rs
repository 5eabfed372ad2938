use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level access-control configuration loaded from a YAML file.
///
/// Every section is optional in the source document. A missing section takes
/// the per-field defaults below, which never widen access: allow-lists
/// default to empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Schema version; currently must be "1.0".
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub file_access: FileAccessPolicy,
    #[serde(default)]
    pub web_access: WebAccessPolicy,
    #[serde(default)]
    pub sandbox: SandboxPolicy,
    /// Consumed only by the browser driver; carried here so the whole
    /// document is typed.
    #[serde(default)]
    pub browser_security: BrowserSecurityPolicy,
    #[serde(default)]
    pub audit: AuditPolicy,
    #[serde(default)]
    pub credentials: CredentialsPolicy,
    #[serde(default)]
    pub emergency: EmergencyPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            file_access: FileAccessPolicy::default(),
            web_access: WebAccessPolicy::default(),
            sandbox: SandboxPolicy::default(),
            browser_security: BrowserSecurityPolicy::default(),
            audit: AuditPolicy::default(),
            credentials: CredentialsPolicy::default(),
            emergency: EmergencyPolicy::default(),
        }
    }
}

impl PolicyConfig {
    /// The hardcoded configuration used when the policy file is missing or
    /// malformed. Placeholders are expanded by the loader.
    pub fn restrictive_default() -> Self {
        Self {
            file_access: FileAccessPolicy {
                allowed_paths: vec![
                    "${APP_HOME}/".into(),
                    "${TMPDIR}/personal-os/".into(),
                    "${CWD}/".into(),
                ],
                blocked_paths: vec![
                    "${HOME}/.ssh/".into(),
                    "/**/.env".into(),
                    "/**/.env.*".into(),
                    "/**/id_rsa".into(),
                    "/**/id_ed25519".into(),
                ],
                sensitive_extensions: default_sensitive_extensions(),
            },
            web_access: WebAccessPolicy {
                allowed_domains: vec![
                    "mail.google.com".into(),
                    "calendar.google.com".into(),
                    "web.whatsapp.com".into(),
                    "accounts.google.com".into(),
                ],
                require_confirmation: vec![
                    "send_email".into(),
                    "send_message".into(),
                    "create_event".into(),
                    "delete_email".into(),
                    "delete_event".into(),
                ],
                rate_limits: BTreeMap::from([
                    ("send_email".to_string(), 50),
                    ("send_message".to_string(), 100),
                    ("create_event".to_string(), 20),
                ]),
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAccessPolicy {
    /// Directory (`/dir/`), recursive glob (`/**/x`) or literal-prefix patterns.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Same pattern forms; a match here always wins over `allowed_paths`.
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    /// Lowercase extensions including the dot, e.g. `.pem`.
    #[serde(default = "default_sensitive_extensions")]
    pub sensitive_extensions: Vec<String>,
}

impl Default for FileAccessPolicy {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            sensitive_extensions: default_sensitive_extensions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebAccessPolicy {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Action names that need a human-in-the-loop step upstream.
    #[serde(default)]
    pub require_confirmation: Vec<String>,
    /// Maximum permitted calls per action in any trailing hour.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, u32>,
}

/// Command policy and resource ceilings for sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxPolicy {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_seconds")]
    pub max_cpu_seconds: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// Wall-clock limit in seconds before a command is force-killed.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            blocked_commands: default_blocked_commands(),
            script_extensions: default_script_extensions(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_seconds: default_max_cpu_seconds(),
            max_file_size_mb: default_max_file_size_mb(),
            execution_timeout: default_execution_timeout(),
        }
    }
}

impl SandboxPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrowserSecurityPolicy {
    #[serde(default = "default_true")]
    pub isolated_session: bool,
    #[serde(default)]
    pub clear_cookies_on_exit: bool,
    #[serde(default = "default_true")]
    pub disable_extensions: bool,
    #[serde(default = "default_true")]
    pub disable_plugins: bool,
    #[serde(default = "default_true")]
    pub capture_screenshots: bool,
    #[serde(default = "default_page_load_timeout")]
    pub page_load_timeout: u64,
    #[serde(default = "default_action_timeout")]
    pub action_timeout: u64,
}

impl Default for BrowserSecurityPolicy {
    fn default() -> Self {
        Self {
            isolated_session: true,
            clear_cookies_on_exit: false,
            disable_extensions: true,
            disable_plugins: true,
            capture_screenshots: true,
            page_load_timeout: default_page_load_timeout(),
            action_timeout: default_action_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_audit_log_file")]
    pub log_file: PathBuf,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            log_file: default_audit_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsPolicy {
    #[serde(default = "default_vault_file")]
    pub vault_file: PathBuf,
    /// Idle seconds before an unlocked vault locks itself; 0 disables.
    #[serde(default = "default_auto_lock_timeout")]
    pub auto_lock_timeout: u64,
}

impl Default for CredentialsPolicy {
    fn default() -> Self {
        Self {
            vault_file: default_vault_file(),
            auto_lock_timeout: default_auto_lock_timeout(),
        }
    }
}

/// Upper bound accepted for `emergency.lockout_duration` (one year).
pub const MAX_LOCKOUT_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmergencyPolicy {
    #[serde(default)]
    pub panic_mode_enabled: bool,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    /// Seconds, at most [`MAX_LOCKOUT_DURATION_SECS`].
    #[serde(default = "default_lockout_duration")]
    pub lockout_duration: u64,
}

impl Default for EmergencyPolicy {
    fn default() -> Self {
        Self {
            panic_mode_enabled: false,
            max_failed_attempts: default_max_failed_attempts(),
            lockout_duration: default_lockout_duration(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sensitive_extensions() -> Vec<String> {
    [".pem", ".key", ".p12", ".pfx", ".crt"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_allowed_commands() -> Vec<String> {
    [
        "python3", "python", "node", "npm", "ls", "cat", "echo", "pwd", "mkdir", "touch", "cp",
        "mv", "grep", "find", "sort", "head", "tail",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_blocked_commands() -> Vec<String> {
    [
        "rm", "rmdir", "del", "format", "dd", "fdisk", "mkfs", "sudo", "su", "doas", "chmod",
        "chown", "curl", "wget", "nc", "netcat", "ssh", "scp", "rsync", "crontab", "at",
        "systemctl", "service",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_script_extensions() -> Vec<String> {
    vec![".py".into(), ".sh".into()]
}

fn default_max_memory_mb() -> u64 {
    512
}

fn default_max_cpu_seconds() -> u64 {
    300
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_page_load_timeout() -> u64 {
    30
}

fn default_action_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_audit_log_file() -> PathBuf {
    PathBuf::from("${AUDIT_LOG}")
}

fn default_vault_file() -> PathBuf {
    PathBuf::from("${VAULT_FILE}")
}

fn default_auto_lock_timeout() -> u64 {
    1800
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_duration() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_empty_sections_are_restrictive() {
        let yaml = r#"
version: "1.0"
"#;
        let config: PolicyConfig = serde_yml::from_str(yaml).unwrap();
        assert!(config.file_access.allowed_paths.is_empty());
        assert!(config.web_access.allowed_domains.is_empty());
        assert!(config.web_access.rate_limits.is_empty());
        assert!(!config.emergency.panic_mode_enabled);
        assert_eq!(config.emergency.max_failed_attempts, 5);
        assert_eq!(config.emergency.lockout_duration, 300);
        assert_eq!(config.credentials.auto_lock_timeout, 1800);
        assert!(config.sandbox.blocked_commands.contains(&"sudo".to_string()));
    }

    #[test]
    fn deserialize_full_config() {
        let yaml = r#"
file_access:
  allowed_paths: ["/home/u/"]
  blocked_paths: ["/home/u/.ssh/", "/**/.env"]
  sensitive_extensions: [".pem"]
web_access:
  allowed_domains: ["mail.example.com"]
  require_confirmation: ["send_email"]
  rate_limits:
    send_message: 10
sandbox:
  allowed_commands: ["echo"]
  blocked_commands: ["sudo"]
  max_memory_mb: 64
  execution_timeout: 5
browser_security:
  clear_cookies_on_exit: true
  page_load_timeout: 60
audit:
  enabled: false
  log_level: WARNING
  log_file: /var/log/pos/audit.jsonl
credentials:
  vault_file: /var/lib/pos/vault.enc
  auto_lock_timeout: 60
emergency:
  panic_mode_enabled: true
  max_failed_attempts: 3
  lockout_duration: 120
"#;
        let config: PolicyConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.file_access.blocked_paths.len(), 2);
        assert_eq!(config.web_access.rate_limits.get("send_message"), Some(&10));
        assert_eq!(config.sandbox.allowed_commands, vec!["echo"]);
        assert_eq!(config.sandbox.max_cpu_seconds, 300);
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(5));
        assert!(config.browser_security.clear_cookies_on_exit);
        assert!(config.browser_security.isolated_session);
        assert!(!config.audit.enabled);
        assert_eq!(config.credentials.auto_lock_timeout, 60);
        assert!(config.emergency.panic_mode_enabled);
        assert_eq!(config.emergency.max_failed_attempts, 3);
    }

    #[test]
    fn restrictive_default_denies_more_than_it_allows() {
        let config = PolicyConfig::restrictive_default();
        assert_eq!(config.file_access.allowed_paths.len(), 3);
        assert!(config.file_access.blocked_paths.len() > config.file_access.allowed_paths.len());
        assert!(config
            .web_access
            .require_confirmation
            .contains(&"send_email".to_string()));
        assert!(!config.emergency.panic_mode_enabled);
    }
}
