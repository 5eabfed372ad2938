//! Disposable execution sandboxes.
//!
//! A [`SandboxSession`] is a private temporary directory (with `tmp/`,
//! `logs/`, `data/`, `scripts/` and `output/` inside) plus every process
//! started in it. Commands pass the policy engine's command check before
//! they are spawned, run with a cleared environment whose `HOME` and
//! `TMPDIR` point into the session, get their own process group and the
//! configured resource ceilings, and are killed as a group on timeout.
//!
//! Closing a session SIGTERMs whatever is still running, waits out a grace
//! period, SIGKILLs the rest and removes the directory.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use policy_engine::{PolicyEngine, PolicyStore};
//! use sandbox::SandboxManager;
//!
//! # async fn example() -> Result<(), sandbox::SandboxError> {
//! let store = Arc::new(PolicyStore::load_or_default("permissions.yaml"));
//! let engine = Arc::new(PolicyEngine::new(store, audit_log::AuditSink::disabled()));
//! let session = SandboxManager::new(engine).create("report")?;
//! let result = session.run(&["ls", "-la"]).await?;
//! println!("{}", result.stdout);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod limits;
mod process;
pub mod python;
mod session;

pub use error::SandboxError;
pub use limits::ResourceLimits;
pub use process::ProcessRegistry;
pub use session::{
    ExecOptions, ExecutionOutcome, ExecutionResult, SandboxManager, SandboxSession,
    SandboxStatus, DEFAULT_GRACE_PERIOD, SKELETON_DIRS,
};
