use audit_log::DecisionRecord;
use serde::{Deserialize, Serialize};

/// The engine's answer to every check. Denials are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    /// Human-readable explanation suitable for direct display. Never
    /// contains secret material.
    pub reason: String,
    /// Allowed, but a human-in-the-loop step is required upstream.
    pub requires_confirmation: bool,
    /// The target is a sensitive file (by extension); callers may demand
    /// extra confirmation.
    pub sensitive: bool,
}

impl AccessDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_confirmation: false,
            sensitive: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_confirmation: false,
            sensitive: false,
        }
    }

    /// Allowed, pending upstream confirmation.
    pub fn confirm(reason: impl Into<String>) -> Self {
        Self {
            requires_confirmation: true,
            ..Self::allow(reason)
        }
    }

    /// Allowed access to a sensitive file.
    pub fn sensitive(reason: impl Into<String>) -> Self {
        Self {
            sensitive: true,
            ..Self::allow(reason)
        }
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    pub fn to_record(&self) -> DecisionRecord {
        DecisionRecord {
            allowed: self.allowed,
            requires_confirmation: self.requires_confirmation,
            reason: self.reason.clone(),
        }
    }
}

/// The operation a file-access check is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Read,
    Write,
    Delete,
    Exec,
}

impl FileOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Exec => "exec",
        }
    }
}

impl std::str::FromStr for FileOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "exec" | "execute" => Ok(Self::Exec),
            other => Err(format!("unknown file operation '{other}'")),
        }
    }
}
