//! Append-only structured JSON-lines audit trail for the personal-os
//! security control plane.
//!
//! Every policy decision, vault mutation and sandbox execution funnels
//! through one [`AuditSink`]. Each event is serialised as a single
//! newline-terminated JSON object and appended to a log file, producing a
//! [JSON Lines](https://jsonlines.org/) stream that is easy to ship, parse,
//! and replay.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditLevel, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/tmp/personal-os/audit.jsonl", AuditLevel::Info).await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::VaultUnlocked,
//!     AuditSource::new("credential-vault"),
//!     serde_json::json!({"services": 2}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditLevel, AuditSource, DecisionRecord};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
