//! # policy-engine
//!
//! Access-control core of the personal automation stack. This crate loads
//! the YAML permissions file into a typed, pre-compiled snapshot and answers
//! "may I do X?" for file paths, web domains, side-effecting actions and
//! sandboxed commands. It also owns the rate-limit windows and the
//! failed-attempt records used for lockout.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use audit_log::AuditSink;
//! use policy_engine::{FileOp, PolicyEngine, PolicyStore};
//!
//! let store = Arc::new(PolicyStore::load_or_default("permissions.yaml"));
//! let engine = PolicyEngine::new(store, AuditSink::disabled());
//! let decision = engine.check_file_access("/home/me/.ssh/id_rsa", FileOp::Read);
//! println!("{decision:?}");
//! ```

mod decision;
mod evaluator;
pub mod loader;
mod lockout;
pub mod matcher;
pub mod paths;
mod rate;
mod schema;
mod store;

// Re-export primary public API at crate root.
pub use decision::{AccessDecision, FileOp};
pub use evaluator::PolicyEngine;
pub use lockout::{LockoutPolicy, LockoutStatus, LockoutTracker};
pub use rate::{RateCheck, RateLimiter, RATE_WINDOW_SECS};
pub use schema::{
    AuditPolicy, BrowserSecurityPolicy, CredentialsPolicy, EmergencyPolicy, FileAccessPolicy,
    PolicyConfig, SandboxPolicy, WebAccessPolicy,
};
pub use store::{PolicySnapshot, PolicySource, PolicyStore};
