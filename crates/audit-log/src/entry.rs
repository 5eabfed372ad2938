use serde::{Deserialize, Serialize};

/// A single audit log entry representing a security-relevant event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub level: AuditLevel,
    pub source: AuditSource,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionRecord>,
}

impl AuditEntry {
    /// Create a new `AuditEntry` with an auto-generated UUID v4, the current
    /// UTC timestamp and the default level for `event_type`. The caller
    /// supplies the source and a free-form details JSON value, which must
    /// never carry secret material.
    pub fn new(event_type: AuditEventType, source: AuditSource, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            level: event_type.default_level(),
            event_type,
            source,
            details,
            decision: None,
        }
    }

    /// Attach the decision that produced this event, consuming and returning
    /// `self` for builder-style usage.
    pub fn with_decision(mut self, decision: DecisionRecord) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Override the level derived from the event type.
    pub fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }
}

/// The category of audit event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PolicyLoaded,
    PolicyFallback,
    FileAccessAllowed,
    FileAccessDenied,
    SensitiveFileAccess,
    WebAccessAllowed,
    WebAccessDenied,
    ActionAllowed,
    ActionConfirmationRequired,
    RateLimitExceeded,
    FailedAuth,
    Lockout,
    VaultCreated,
    VaultUnlocked,
    VaultLocked,
    VaultAutoLocked,
    CredentialStored,
    CredentialRetrieved,
    CredentialDeleted,
    MasterPasswordChanged,
    SandboxCreated,
    SandboxDestroyed,
    CommandBlocked,
    CommandExecuted,
    CommandTimedOut,
    PanicModeRefusal,
    /// Free-form event raised by a collaborator through the engine.
    SecurityEvent,
}

impl AuditEventType {
    /// Lockouts, policy violations and authentication failures are alert
    /// events and are kept apart from routine allow/deny logging.
    pub fn is_alert(self) -> bool {
        matches!(
            self,
            Self::Lockout
                | Self::FailedAuth
                | Self::CommandBlocked
                | Self::PanicModeRefusal
                | Self::PolicyFallback
        )
    }

    /// Level an entry of this type is written at unless overridden.
    pub fn default_level(self) -> AuditLevel {
        match self {
            Self::Lockout | Self::FailedAuth | Self::CommandBlocked | Self::PanicModeRefusal => {
                AuditLevel::Error
            }
            Self::PolicyFallback
            | Self::FileAccessDenied
            | Self::WebAccessDenied
            | Self::RateLimitExceeded
            | Self::CommandTimedOut
            | Self::VaultAutoLocked => AuditLevel::Warning,
            Self::SandboxCreated | Self::SandboxDestroyed => AuditLevel::Debug,
            _ => AuditLevel::Info,
        }
    }
}

/// Severity attached to each entry; the sink drops entries below its
/// configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    /// Parse a level name as written in policy files (`INFO`, `warning`,
    /// `CRITICAL`, ...). Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warning),
            "error" | "critical" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Identifies the component and optional session for the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuditSource {
    /// Convenience constructor that only requires the component name.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Records the outcome of a policy check attached to an audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub allowed: bool,
    pub requires_confirmation: bool,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_events_are_distinguished() {
        assert!(AuditEventType::Lockout.is_alert());
        assert!(AuditEventType::FailedAuth.is_alert());
        assert!(AuditEventType::CommandBlocked.is_alert());
        assert!(!AuditEventType::FileAccessAllowed.is_alert());
        assert!(!AuditEventType::WebAccessDenied.is_alert());
    }

    #[test]
    fn level_parsing_accepts_policy_spellings() {
        assert_eq!(AuditLevel::parse("INFO"), Some(AuditLevel::Info));
        assert_eq!(AuditLevel::parse("WARNING"), Some(AuditLevel::Warning));
        assert_eq!(AuditLevel::parse("critical"), Some(AuditLevel::Error));
        assert_eq!(AuditLevel::parse("verbose"), None);
        assert!(AuditLevel::Error > AuditLevel::Info);
    }

    #[test]
    fn entry_serializes_snake_case_and_skips_empty_decision() {
        let entry = AuditEntry::new(
            AuditEventType::RateLimitExceeded,
            AuditSource::new("policy-engine"),
            serde_json::json!({"action": "send_email"}),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event_type"], "rate_limit_exceeded");
        assert_eq!(json["level"], "warning");
        assert!(json.get("decision").is_none());
        assert!(json["source"].get("session_id").is_none());
    }

    #[test]
    fn decision_is_attached() {
        let entry = AuditEntry::new(
            AuditEventType::WebAccessDenied,
            AuditSource::new("policy-engine").with_session("s-1"),
            serde_json::json!({"domain": "evil.com"}),
        )
        .with_decision(DecisionRecord {
            allowed: false,
            requires_confirmation: false,
            reason: "Domain not in allowed list: evil.com".into(),
        });
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["decision"]["allowed"], false);
        assert_eq!(json["source"]["session_id"], "s-1");
    }
}
