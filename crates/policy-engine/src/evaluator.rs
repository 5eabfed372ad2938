use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use audit_log::{AuditEntry, AuditEventType, AuditLevel, AuditSink, AuditSource};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::decision::{AccessDecision, FileOp};
use crate::lockout::{LockoutPolicy, LockoutTracker};
use crate::matcher::{command_basename, domain_matches, has_extension, normalize_path};
use crate::rate::{RateCheck, RateLimiter};
use crate::schema::{BrowserSecurityPolicy, CredentialsPolicy, PolicyConfig, SandboxPolicy};
use crate::store::{PolicySnapshot, PolicyStore};

/// Audit component name for entries raised by the engine.
const COMPONENT: &str = "policy-engine";

/// Labels a collaborator may pass to [`PolicyEngine::log_security_event`]
/// that are recorded at error level.
const ALERT_LABELS: &[&str] = &["VIOLATION", "BLOCKED", "FAILED_AUTH", "LOCKOUT"];

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Decision functions over the current [`PolicySnapshot`] plus the two
/// mutable tables (rate windows and failure records), each behind its own
/// lock.
///
/// Every check is synchronous and never suspends; audit entries are queued
/// with [`AuditSink::try_log`].
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
    rate: RateLimiter,
    lockout: LockoutTracker,
    audit: AuditSink,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.store.snapshot();
        f.debug_struct("PolicyEngine")
            .field("source", snapshot.source())
            .field("panic_mode", &snapshot.config().emergency.panic_mode_enabled)
            .field("audit", &self.audit)
            .finish()
    }
}

impl PolicyEngine {
    pub fn new(store: Arc<PolicyStore>, audit: AuditSink) -> Self {
        let engine = Self {
            store,
            rate: RateLimiter::new(),
            lockout: LockoutTracker::new(),
            audit,
        };
        engine.announce_snapshot();
        engine
    }

    /// Engine over an in-memory configuration with auditing disabled.
    pub fn from_config(config: PolicyConfig) -> Result<Self> {
        let store = PolicyStore::from_config(config)?;
        Ok(Self::new(Arc::new(store), AuditSink::disabled()))
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.store.snapshot()
    }

    /// The sink this engine audits into; shared with the vault and sandbox.
    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Reload the policy source. Counters survive the reload.
    pub fn reload(&self) -> Result<()> {
        self.store.reload()?;
        self.announce_snapshot();
        Ok(())
    }

    // -- file access --------------------------------------------------------

    /// Deny-first path check. The path is made absolute and resolved
    /// lexically before matching.
    pub fn check_file_access(&self, path: impl AsRef<Path>, op: FileOp) -> AccessDecision {
        let snapshot = self.snapshot();
        let abs = normalize_path(path.as_ref());
        let shown = abs.display().to_string();

        let decision = evaluate_file_access(&snapshot, &abs);
        let event = if decision.is_denied() {
            warn!(path = %shown, operation = op.as_str(), reason = %decision.reason, "file access denied");
            AuditEventType::FileAccessDenied
        } else if decision.sensitive {
            info!(path = %shown, operation = op.as_str(), "sensitive file access");
            AuditEventType::SensitiveFileAccess
        } else {
            debug!(path = %shown, operation = op.as_str(), "file access granted");
            AuditEventType::FileAccessAllowed
        };
        self.emit(
            event,
            json!({ "path": shown, "operation": op.as_str() }),
            Some(&decision),
        );
        decision
    }

    // -- web access ---------------------------------------------------------

    /// Exact or subdomain match against the allowed domains.
    pub fn check_web_access(&self, domain: &str) -> AccessDecision {
        let snapshot = self.snapshot();
        let allowed = &snapshot.config().web_access.allowed_domains;

        let decision = match allowed.iter().find(|a| domain_matches(a, domain)) {
            Some(a) if a.trim_end_matches('.').eq_ignore_ascii_case(domain.trim_end_matches('.')) => {
                AccessDecision::allow("Domain access granted")
            }
            Some(_) => AccessDecision::allow("Subdomain access granted"),
            None => AccessDecision::deny(format!("Domain not in allowed list: {domain}")),
        };

        let event = if decision.allowed {
            debug!(domain, "web access granted");
            AuditEventType::WebAccessAllowed
        } else {
            warn!(domain, "web access denied");
            AuditEventType::WebAccessDenied
        };
        self.emit(event, json!({ "domain": domain }), Some(&decision));
        decision
    }

    // -- actions ------------------------------------------------------------

    pub fn check_action_permission(&self, action: &str) -> AccessDecision {
        self.check_action_permission_at(action, Utc::now())
    }

    /// Confirmation-required actions are allowed with the flag set and never
    /// consume rate-limit capacity. Otherwise a configured limit is enforced
    /// over the trailing hour; unlimited actions are allowed.
    pub fn check_action_permission_at(&self, action: &str, now: DateTime<Utc>) -> AccessDecision {
        let snapshot = self.snapshot();
        let web = &snapshot.config().web_access;

        if web.require_confirmation.iter().any(|a| a == action) {
            info!(action, "action requires confirmation");
            let decision =
                AccessDecision::confirm(format!("Action '{action}' requires user confirmation"));
            self.emit(
                AuditEventType::ActionConfirmationRequired,
                json!({ "action": action }),
                Some(&decision),
            );
            return decision;
        }

        if let Some(limit) = web.rate_limits.get(action).copied() {
            match self.rate.check_and_record(action, limit, now) {
                RateCheck::Exceeded { limit, retry_at } => {
                    warn!(action, limit, %retry_at, "rate limit exceeded");
                    let decision =
                        AccessDecision::deny(format!("Rate limit exceeded for action '{action}'"));
                    self.emit(
                        AuditEventType::RateLimitExceeded,
                        json!({
                            "action": action,
                            "limit": limit,
                            "retry_at": retry_at.to_rfc3339(),
                        }),
                        Some(&decision),
                    );
                    return decision;
                }
                RateCheck::Allowed { used, limit } => {
                    debug!(action, used, limit, "rate-limited action recorded");
                }
            }
        }

        let decision = AccessDecision::allow("Action permitted");
        self.emit(
            AuditEventType::ActionAllowed,
            json!({ "action": action }),
            Some(&decision),
        );
        decision
    }

    // -- lockout ------------------------------------------------------------

    /// Returns `true` when this failure puts `identifier` into lockout.
    pub fn record_failed_attempt(&self, identifier: &str) -> bool {
        self.record_failed_attempt_at(identifier, Utc::now())
    }

    pub fn record_failed_attempt_at(&self, identifier: &str, now: DateTime<Utc>) -> bool {
        let policy = self.lockout_policy();
        let status = self.lockout.record_failure(identifier, policy, now);

        self.emit(
            AuditEventType::FailedAuth,
            json!({ "identifier": identifier, "recent_failures": status.recent_failures }),
            None,
        );

        if status.locked_out {
            warn!(
                identifier,
                failed_attempts = status.recent_failures,
                "identifier locked out"
            );
            self.emit(
                AuditEventType::Lockout,
                json!({
                    "identifier": identifier,
                    "failed_attempts": status.recent_failures,
                    "lockout_until": status.locked_until.map(|t| t.to_rfc3339()),
                }),
                None,
            );
        }
        status.locked_out
    }

    pub fn is_locked_out(&self, identifier: &str) -> bool {
        self.is_locked_out_at(identifier, Utc::now())
    }

    pub fn is_locked_out_at(&self, identifier: &str, now: DateTime<Utc>) -> bool {
        self.lockout.is_locked_out(identifier, self.lockout_policy(), now)
    }

    pub fn clear_failed_attempts(&self, identifier: &str) {
        self.lockout.clear(identifier);
    }

    pub fn is_panic_mode(&self) -> bool {
        self.snapshot().config().emergency.panic_mode_enabled
    }

    // -- commands -----------------------------------------------------------

    /// Command policy for sandboxed execution.
    ///
    /// The deny-list wins over everything, including executables placed in
    /// the sandbox root. Otherwise the command must be allow-listed, live
    /// inside `sandbox_root`, or carry a script extension.
    pub fn check_command(&self, program: &str, sandbox_root: Option<&Path>) -> AccessDecision {
        let snapshot = self.snapshot();
        let decision = evaluate_command(&snapshot.config().sandbox, program, sandbox_root);
        if decision.is_denied() {
            warn!(program, reason = %decision.reason, "command rejected by policy");
        } else {
            debug!(program, "command permitted by policy");
        }
        decision
    }

    pub fn sandbox_limits(&self) -> SandboxPolicy {
        self.snapshot().config().sandbox.clone()
    }

    pub fn browser_security(&self) -> BrowserSecurityPolicy {
        self.snapshot().config().browser_security.clone()
    }

    pub fn credentials_policy(&self) -> CredentialsPolicy {
        self.snapshot().config().credentials.clone()
    }

    // -- collaborator hook --------------------------------------------------

    /// Record a free-form security event raised outside the engine.
    ///
    /// `label` is a short upper-case tag such as `VIOLATION`; alert labels
    /// are written at error level. `details` must not carry secrets.
    pub fn log_security_event(&self, label: &str, details: serde_json::Value) {
        let level = if ALERT_LABELS.contains(&label) {
            AuditLevel::Error
        } else {
            AuditLevel::Info
        };
        info!(label, "security event");
        let entry = AuditEntry::new(
            AuditEventType::SecurityEvent,
            AuditSource::new(COMPONENT),
            json!({ "label": label, "details": details }),
        )
        .with_level(level);
        self.audit.try_log(entry);
    }

    // -- internals ----------------------------------------------------------

    fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy::from(&self.snapshot().config().emergency)
    }

    fn announce_snapshot(&self) {
        let snapshot = self.snapshot();
        match self.store.fallback_reason() {
            Some(reason) => self.emit(
                AuditEventType::PolicyFallback,
                json!({ "reason": reason }),
                None,
            ),
            None => self.emit(
                AuditEventType::PolicyLoaded,
                json!({
                    "source": format!("{:?}", snapshot.source()),
                    "panic_mode": snapshot.config().emergency.panic_mode_enabled,
                }),
                None,
            ),
        }
    }

    fn emit(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
        decision: Option<&AccessDecision>,
    ) {
        let mut entry = AuditEntry::new(event_type, AuditSource::new(COMPONENT), details);
        if let Some(decision) = decision {
            entry = entry.with_decision(decision.to_record());
        }
        self.audit.try_log(entry);
    }
}

// ---------------------------------------------------------------------------
// Pure evaluation
// ---------------------------------------------------------------------------

fn evaluate_file_access(snapshot: &PolicySnapshot, abs: &Path) -> AccessDecision {
    if let Some(blocked) = snapshot.blocked_patterns().iter().find(|p| p.matches(abs)) {
        return AccessDecision::deny(format!(
            "Access denied: Path is blocked ({})",
            blocked.as_str()
        ));
    }

    let allowed = snapshot.allowed_patterns();
    if allowed.is_empty() {
        return AccessDecision::deny("No allowed paths configured");
    }

    if allowed.iter().any(|p| p.matches(abs)) {
        let sensitive = &snapshot.config().file_access.sensitive_extensions;
        if has_extension(abs, sensitive) {
            return AccessDecision::sensitive(format!("Sensitive file access: {}", abs.display()));
        }
        return AccessDecision::allow("Access granted");
    }

    AccessDecision::deny("Access denied: Path not in allowed directories")
}

fn evaluate_command(
    policy: &SandboxPolicy,
    program: &str,
    sandbox_root: Option<&Path>,
) -> AccessDecision {
    let base = command_basename(program);
    if base.is_empty() {
        return AccessDecision::deny("Empty command");
    }

    if policy.blocked_commands.iter().any(|c| c == base) {
        return AccessDecision::deny(format!("Command is blocked by policy: {base}"));
    }

    if policy.allowed_commands.iter().any(|c| c == base) {
        return AccessDecision::allow(format!("Command permitted: {base}"));
    }

    let exe = Path::new(program);
    if let Some(root) = sandbox_root {
        if exe.is_absolute() && normalize_path(exe).starts_with(normalize_path(root)) {
            return AccessDecision::allow(format!("Sandbox executable permitted: {base}"));
        }
    }

    if has_extension(exe, &policy.script_extensions) {
        return AccessDecision::allow(format!("Script permitted: {base}"));
    }

    AccessDecision::deny(format!("Command not in allowed list: {base}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_policy_with;
    use crate::paths::Substitutions;
    use chrono::{Duration, TimeZone};

    fn engine_from_yaml(yaml: &str) -> PolicyEngine {
        let config = load_policy_with(yaml, &Substitutions::default()).unwrap();
        PolicyEngine::from_config(config).unwrap()
    }

    fn basic_engine() -> PolicyEngine {
        engine_from_yaml(
            r#"
file_access:
  allowed_paths: ["/home/u/", "/srv/data/**/reports/*"]
  blocked_paths: ["/home/u/.ssh/", "/**/.env"]
web_access:
  allowed_domains: ["mail.example.com"]
  require_confirmation: ["send_email"]
  rate_limits:
    send: 3
    send_email: 1
emergency:
  max_failed_attempts: 5
  lockout_duration: 300
"#,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    // ---- file access ----

    #[test]
    fn block_beats_allow() {
        let engine = basic_engine();
        let d = engine.check_file_access("/home/u/.ssh/id_rsa", FileOp::Read);
        assert!(d.is_denied());
        assert_eq!(d.reason, "Access denied: Path is blocked (/home/u/.ssh/)");
    }

    #[test]
    fn glob_block_matches_anywhere() {
        let engine = basic_engine();
        let d = engine.check_file_access("/home/u/project/.env", FileOp::Read);
        assert!(d.is_denied());
    }

    #[test]
    fn allowed_directory_grants() {
        let engine = basic_engine();
        let d = engine.check_file_access("/home/u/docs/letter.txt", FileOp::Write);
        assert!(d.allowed);
        assert_eq!(d.reason, "Access granted");
        assert!(!d.sensitive);
    }

    #[test]
    fn traversal_is_resolved_before_matching() {
        let engine = basic_engine();
        let d = engine.check_file_access("/home/u/docs/../.ssh/config", FileOp::Read);
        assert!(d.is_denied());
        let d = engine.check_file_access("/home/u/../other/file", FileOp::Read);
        assert!(d.is_denied());
    }

    #[test]
    fn outside_allowed_paths_is_denied() {
        let engine = basic_engine();
        let d = engine.check_file_access("/etc/passwd", FileOp::Read);
        assert!(d.is_denied());
        assert_eq!(d.reason, "Access denied: Path not in allowed directories");
    }

    #[test]
    fn directory_pattern_does_not_match_sibling_prefix() {
        let engine = basic_engine();
        assert!(engine
            .check_file_access("/home/user2/file", FileOp::Read)
            .is_denied());
    }

    #[test]
    fn glob_allow_pattern() {
        let engine = basic_engine();
        assert!(engine
            .check_file_access("/srv/data/2026/q1/reports/summary.csv", FileOp::Read)
            .allowed);
    }

    #[test]
    fn sensitive_extension_is_flagged() {
        let engine = basic_engine();
        let d = engine.check_file_access("/home/u/certs/server.PEM", FileOp::Read);
        assert!(d.allowed);
        assert!(d.sensitive);
        assert!(d.reason.starts_with("Sensitive file access: "));
    }

    #[test]
    fn empty_allow_list_denies() {
        let engine = engine_from_yaml("file_access:\n  blocked_paths: []\n");
        let d = engine.check_file_access("/anything", FileOp::Read);
        assert!(d.is_denied());
        assert_eq!(d.reason, "No allowed paths configured");
    }

    // ---- web access ----

    #[test]
    fn domain_exact_and_subdomain() {
        let engine = basic_engine();
        let exact = engine.check_web_access("mail.example.com");
        assert!(exact.allowed);
        assert_eq!(exact.reason, "Domain access granted");

        let sub = engine.check_web_access("sub.mail.example.com");
        assert!(sub.allowed);
        assert_eq!(sub.reason, "Subdomain access granted");

        let evil = engine.check_web_access("evil.com");
        assert!(evil.is_denied());
        assert_eq!(evil.reason, "Domain not in allowed list: evil.com");
    }

    #[test]
    fn suffix_without_dot_is_not_a_subdomain() {
        let engine = basic_engine();
        assert!(engine.check_web_access("evilmail.example.com").is_denied());
        assert!(engine.check_web_access("example.com").is_denied());
    }

    // ---- actions ----

    #[test]
    fn confirmation_required_action() {
        let engine = basic_engine();
        for _ in 0..3 {
            let d = engine.check_action_permission_at("send_email", t0());
            assert!(d.allowed);
            assert!(d.requires_confirmation);
            assert_eq!(d.reason, "Action 'send_email' requires user confirmation");
        }
    }

    #[test]
    fn rate_limit_denies_after_limit_and_recovers() {
        let engine = basic_engine();
        for i in 0..3 {
            let d = engine.check_action_permission_at("send", t0() + Duration::seconds(i));
            assert!(d.allowed, "call {i} should be allowed");
            assert!(!d.requires_confirmation);
        }
        let d = engine.check_action_permission_at("send", t0() + Duration::minutes(10));
        assert!(d.is_denied());
        assert_eq!(d.reason, "Rate limit exceeded for action 'send'");

        let later = t0() + Duration::hours(1) + Duration::seconds(1);
        assert!(engine.check_action_permission_at("send", later).allowed);
    }

    #[test]
    fn unlimited_action_is_allowed() {
        let engine = basic_engine();
        for _ in 0..100 {
            let d = engine.check_action_permission_at("read_inbox", t0());
            assert!(d.allowed);
            assert_eq!(d.reason, "Action permitted");
        }
    }

    // ---- lockout ----

    #[test]
    fn lockout_after_five_failures_and_self_clear() {
        let engine = basic_engine();
        for i in 0..4 {
            assert!(!engine.record_failed_attempt_at("login", t0() + Duration::seconds(i)));
        }
        assert!(engine.record_failed_attempt_at("login", t0() + Duration::seconds(4)));
        assert!(engine.is_locked_out_at("login", t0() + Duration::seconds(10)));
        assert!(!engine.is_locked_out_at("login", t0() + Duration::seconds(310)));
    }

    #[test]
    fn huge_lockout_duration_does_not_panic() {
        let mut config = crate::PolicyConfig::default();
        config.emergency.max_failed_attempts = 3;
        config.emergency.lockout_duration = 100_000_000_000_000;
        let engine = PolicyEngine::from_config(config).unwrap();

        assert!(!engine.record_failed_attempt_at("alice", t0()));
        assert!(!engine.record_failed_attempt_at("alice", t0() + Duration::seconds(1)));
        assert!(engine.record_failed_attempt_at("alice", t0() + Duration::seconds(2)));
        assert!(engine.is_locked_out_at("alice", t0() + Duration::days(364)));
        assert!(!engine.is_locked_out_at("alice", t0() + Duration::days(366)));
    }

    #[test]
    fn clear_failed_attempts_resets() {
        let engine = basic_engine();
        for i in 0..5 {
            engine.record_failed_attempt_at("vault", t0() + Duration::seconds(i));
        }
        engine.clear_failed_attempts("vault");
        assert!(!engine.is_locked_out_at("vault", t0() + Duration::seconds(6)));
    }

    #[test]
    fn panic_mode_flag() {
        assert!(!basic_engine().is_panic_mode());
        let engine = engine_from_yaml("emergency:\n  panic_mode_enabled: true\n");
        assert!(engine.is_panic_mode());
    }

    // ---- commands ----

    #[test]
    fn deny_listed_command_rejected_even_inside_sandbox() {
        let engine = basic_engine();
        let root = Path::new("/tmp/sbx");
        let d = engine.check_command("/tmp/sbx/sudo", Some(root));
        assert!(d.is_denied());
        assert_eq!(d.reason, "Command is blocked by policy: sudo");
        assert!(engine.check_command("rm", None).is_denied());
    }

    #[test]
    fn allow_listed_command_outside_sandbox_permitted() {
        let engine = basic_engine();
        assert!(engine.check_command("/bin/ls", Some(Path::new("/tmp/sbx"))).allowed);
        assert!(engine.check_command("echo", None).allowed);
    }

    #[test]
    fn executable_inside_sandbox_permitted() {
        let engine = basic_engine();
        let d = engine.check_command("/tmp/sbx/scripts/tool", Some(Path::new("/tmp/sbx")));
        assert!(d.allowed);
        assert!(engine
            .check_command("/tmp/sbx/../elsewhere/tool", Some(Path::new("/tmp/sbx")))
            .is_denied());
    }

    #[test]
    fn script_extension_permitted_and_unknown_rejected() {
        let engine = basic_engine();
        assert!(engine.check_command("/opt/job/run.sh", None).allowed);
        let d = engine.check_command("/opt/job/mystery", Some(Path::new("/tmp/sbx")));
        assert!(d.is_denied());
        assert_eq!(d.reason, "Command not in allowed list: mystery");
    }

    #[test]
    fn sandbox_limits_come_from_snapshot() {
        let engine = engine_from_yaml("sandbox:\n  max_memory_mb: 64\n  execution_timeout: 5\n");
        let limits = engine.sandbox_limits();
        assert_eq!(limits.max_memory_mb, 64);
        assert_eq!(limits.timeout(), std::time::Duration::from_secs(5));
    }

    // ---- audit ----

    #[tokio::test]
    async fn decisions_and_events_reach_the_audit_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let (sink, handle) = AuditSink::start(&log_path, AuditLevel::Debug).await.unwrap();

        let config = load_policy_with(
            "web_access:\n  allowed_domains: [\"mail.example.com\"]\n",
            &Substitutions::default(),
        )
        .unwrap();
        let store = Arc::new(PolicyStore::from_config(config).unwrap());
        let engine = PolicyEngine::new(store, sink);

        engine.check_web_access("evil.com");
        engine.log_security_event("VIOLATION", json!({ "what": "test" }));
        drop(engine);
        handle.await.unwrap();

        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        let entries: Vec<AuditEntry> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event_type, AuditEventType::PolicyLoaded);
        assert_eq!(entries[1].event_type, AuditEventType::WebAccessDenied);
        assert_eq!(
            entries[1].decision.as_ref().map(|d| d.allowed),
            Some(false)
        );
        assert_eq!(entries[2].event_type, AuditEventType::SecurityEvent);
        assert_eq!(entries[2].level, AuditLevel::Error);
    }
}
