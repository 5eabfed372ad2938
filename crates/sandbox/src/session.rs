use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use futures_util::future::BoxFuture;
use policy_engine::PolicyEngine;
use serde::Serialize;
use serde_json::json;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::process::{kill_group, ProcessRegistry};
use crate::python;

/// Audit component name for entries raised by sandbox sessions.
const COMPONENT: &str = "sandbox";

/// Subdirectories created in every session root.
pub const SKELETON_DIRS: &[&str] = &["tmp", "logs", "data", "scripts", "output"];

/// Host variables passed through to sandboxed commands. Everything else is
/// cleared.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "TERM"];

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Default SIGTERM-to-SIGKILL grace period at teardown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    /// Nonzero exit, or killed by a signal (`code` is `None`).
    Failed { code: Option<i32> },
    /// Rejected by command policy before spawning.
    PolicyViolation { reason: String },
    /// Wall-clock limit hit; the process group was killed.
    TimedOut { after: Duration },
    SpawnFailed { reason: String },
}

/// Captured result of one sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionResult {
    fn rejected(reason: String) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: format!("Command blocked by security policy: {reason}"),
            exit_code: None,
            outcome: ExecutionOutcome::PolicyViolation { reason },
        }
    }

    fn spawn_failed(reason: String) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: reason.clone(),
            exit_code: None,
            outcome: ExecutionOutcome::SpawnFailed { reason },
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: format!("Command timed out after {} seconds", after.as_secs_f64()),
            exit_code: None,
            outcome: ExecutionOutcome::TimedOut { after },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::TimedOut { .. })
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::PolicyViolation { .. })
    }
}

/// Optional knobs for [`SandboxSession::execute_command`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Relative paths resolve against the session root; default is the root.
    pub working_dir: Option<PathBuf>,
    /// Extra variables. The sandbox's own `HOME`/`TMPDIR` redirection wins.
    pub env: BTreeMap<String, String>,
    /// Overrides the policy's execution timeout.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Snapshot for system-status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxStatus {
    pub active: bool,
    pub name: String,
    pub root: Option<PathBuf>,
    pub active_processes: usize,
    pub limits: ResourceLimits,
}

// ---------------------------------------------------------------------------
// SandboxManager
// ---------------------------------------------------------------------------

/// Creates sandbox sessions bound to one [`PolicyEngine`].
#[derive(Debug, Clone)]
pub struct SandboxManager {
    engine: Arc<PolicyEngine>,
    grace_period: Duration,
    base_dir: Option<PathBuf>,
}

impl SandboxManager {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self {
            engine,
            grace_period: DEFAULT_GRACE_PERIOD,
            base_dir: None,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Create session directories under `dir` instead of the system temp dir.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Create a fresh session. Refused in panic mode.
    ///
    /// Prefer [`with_sandbox`](Self::with_sandbox), which always tears the
    /// session down. A session created here must be [`close`]d; dropping it
    /// only performs a best-effort synchronous cleanup.
    ///
    /// [`close`]: SandboxSession::close
    pub fn create(&self, name: &str) -> Result<SandboxSession, SandboxError> {
        let audit = self.engine.audit().clone();
        if self.engine.is_panic_mode() {
            warn!(name, "sandbox creation refused: panic mode");
            audit.try_log(AuditEntry::new(
                AuditEventType::PanicModeRefusal,
                AuditSource::new(COMPONENT),
                json!({ "operation": "create_sandbox", "name": name }),
            ));
            return Err(SandboxError::PanicMode);
        }

        let mut builder = tempfile::Builder::new();
        let prefix = format!("{}_", sanitize_name(name));
        builder.prefix(&prefix);
        let dir = match &self.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base).map_err(|e| SandboxError::io(base, e))?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::io(std::env::temp_dir(), e))?;

        let root = dir.path().to_path_buf();
        for sub in SKELETON_DIRS {
            let path = root.join(sub);
            std::fs::create_dir_all(&path).map_err(|e| SandboxError::io(&path, e))?;
        }

        let limits = ResourceLimits::from(&self.engine.sandbox_limits());
        info!(name, root = %root.display(), "created sandbox");
        audit.try_log(
            AuditEntry::new(
                AuditEventType::SandboxCreated,
                AuditSource::new(COMPONENT).with_session(name),
                json!({ "root": root.display().to_string() }),
            ),
        );

        Ok(SandboxSession {
            name: name.to_string(),
            root,
            dir: Mutex::new(Some(dir)),
            processes: ProcessRegistry::new(),
            closed: AtomicBool::new(false),
            engine: Arc::clone(&self.engine),
            limits,
            grace_period: self.grace_period,
            audit,
        })
    }

    /// Run `f` against a fresh session and tear it down afterwards, whether
    /// `f` returns normally or not.
    ///
    /// ```rust,no_run
    /// # async fn example(manager: sandbox::SandboxManager) -> Result<(), sandbox::SandboxError> {
    /// let echoed = manager
    ///     .with_sandbox("report", |s| Box::pin(async move { s.run(&["echo", "hi"]).await }))
    ///     .await??;
    /// println!("{}", echoed.stdout);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_sandbox<T, F>(&self, name: &str, f: F) -> Result<T, SandboxError>
    where
        F: for<'s> FnOnce(&'s SandboxSession) -> BoxFuture<'s, T>,
    {
        let session = self.create(name)?;
        let out = f(&session).await;
        session.close().await;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// SandboxSession
// ---------------------------------------------------------------------------

/// One disposable working directory plus the processes started in it.
pub struct SandboxSession {
    name: String,
    root: PathBuf,
    dir: Mutex<Option<TempDir>>,
    processes: ProcessRegistry,
    closed: AtomicBool,
    engine: Arc<PolicyEngine>,
    limits: ResourceLimits,
    grace_period: Duration,
    audit: AuditSink,
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .field("active_processes", &self.processes.len())
            .finish()
    }
}

impl SandboxSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// [`execute_command`](Self::execute_command) with default options.
    pub async fn run<S: AsRef<str>>(&self, argv: &[S]) -> Result<ExecutionResult, SandboxError> {
        self.execute_command(argv, ExecOptions::default()).await
    }

    /// Run `argv` after the command policy accepts it.
    ///
    /// The child gets a cleared environment (plus `PATH`/locale), `HOME` and
    /// `TMPDIR` inside the session root, its own process group and the
    /// policy's resource ceilings. On timeout the whole group is killed.
    pub async fn execute_command<S: AsRef<str>>(
        &self,
        argv: &[S],
        opts: ExecOptions,
    ) -> Result<ExecutionResult, SandboxError> {
        self.ensure_open()?;

        let Some((program, args)) = argv.split_first() else {
            return Ok(ExecutionResult::rejected("Empty command".to_string()));
        };
        let program = program.as_ref();

        let decision = self.engine.check_command(program, Some(self.root.as_path()));
        if decision.is_denied() {
            self.audit
                .log(self.entry(
                    AuditEventType::CommandBlocked,
                    json!({ "program": program, "reason": decision.reason }),
                ))
                .await;
            return Ok(ExecutionResult::rejected(decision.reason));
        }

        let working_dir = match opts.working_dir {
            Some(dir) if dir.is_relative() => self.root.join(dir),
            Some(dir) => dir,
            None => self.root.clone(),
        };
        let timeout = opts.timeout.unwrap_or(self.limits.timeout);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args.iter().map(AsRef::<str>::as_ref))
            .current_dir(&working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if std::env::var_os("PATH").is_none() {
            cmd.env("PATH", FALLBACK_PATH);
        }
        cmd.envs(&opts.env);
        let tmp = self.root.join("tmp");
        cmd.env("HOME", &self.root)
            .env("TMPDIR", &tmp)
            .env("TMP", &tmp)
            .env("TEMP", &tmp)
            .env("PERSONAL_OS_SANDBOX", &self.root)
            .env("PERSONAL_OS_MODE", "sandbox");

        #[cfg(unix)]
        cmd.process_group(0);
        self.limits.apply(&mut cmd);

        let started = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program, error = %e, "failed to spawn sandboxed command");
                return Ok(ExecutionResult::spawn_failed(format!(
                    "failed to spawn {program}: {e}"
                )));
            }
        };
        let pgid = child.id();
        if let Some(pgid) = pgid {
            self.processes.register(pgid);
        }
        debug!(program, ?pgid, "sandboxed command started");

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match waited {
            Ok(Ok(output)) => {
                let code = output.status.code();
                let success = output.status.success();
                ExecutionResult {
                    success,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: code,
                    outcome: if success {
                        ExecutionOutcome::Completed
                    } else {
                        ExecutionOutcome::Failed { code }
                    },
                }
            }
            Ok(Err(e)) => ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to collect output: {e}"),
                exit_code: None,
                outcome: ExecutionOutcome::Failed { code: None },
            },
            // The dropped child is killed by kill_on_drop; the group kill
            // catches anything it forked.
            Err(_) => {
                if let Some(pgid) = pgid {
                    kill_group(pgid);
                }
                ExecutionResult::timed_out(timeout)
            }
        };

        if let Some(pgid) = pgid {
            self.processes.release_if_gone(pgid);
        }

        if result.is_timeout() {
            warn!(program, timeout_secs = timeout.as_secs_f64(), "sandboxed command timed out");
            self.audit
                .log(self.entry(
                    AuditEventType::CommandTimedOut,
                    json!({ "program": program, "timeout_ms": timeout.as_millis() as u64 }),
                ))
                .await;
        } else {
            info!(program, exit_code = ?result.exit_code, elapsed_ms, "sandboxed command finished");
            self.audit
                .log(self.entry(
                    AuditEventType::CommandExecuted,
                    json!({
                        "program": program,
                        "exit_code": result.exit_code,
                        "success": result.success,
                        "elapsed_ms": elapsed_ms,
                    }),
                ))
                .await;
        }
        Ok(result)
    }

    /// Run a Python snippet through the import/builtins filter in
    /// [`python`](crate::python). Best-effort only; the process boundary and
    /// resource ceilings are what actually confine the code.
    pub async fn execute_python_code(
        &self,
        code: &str,
        allowed_imports: Option<&[String]>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.ensure_open()?;
        let allowed = match allowed_imports {
            Some(list) => list.to_vec(),
            None => python::default_allowed_imports(),
        };
        let script = python::restricted_script(code, &allowed);

        let scripts = self.root.join("scripts");
        let mut file = tempfile::Builder::new()
            .prefix("sandbox_code_")
            .suffix(".py")
            .tempfile_in(&scripts)
            .map_err(|e| SandboxError::io(&scripts, e))?;
        file.write_all(script.as_bytes())
            .map_err(|e| SandboxError::io(file.path(), e))?;
        let (_, path) = file.keep().map_err(|e| SandboxError::io(&scripts, e.error))?;

        let path = path.to_string_lossy().into_owned();
        self.execute_command(&["python3", path.as_str()], ExecOptions::default())
            .await
    }

    /// Write `content` to a new owner-only file under `tmp/`.
    pub fn create_secure_temp_file(
        &self,
        content: &str,
        suffix: &str,
    ) -> Result<PathBuf, SandboxError> {
        self.ensure_open()?;
        let tmp = self.root.join("tmp");
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile_in(&tmp)
            .map_err(|e| SandboxError::io(&tmp, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SandboxError::io(file.path(), e))?;
        }
        file.write_all(content.as_bytes())
            .map_err(|e| SandboxError::io(file.path(), e))?;
        let (_, path) = file.keep().map_err(|e| SandboxError::io(&tmp, e.error))?;
        Ok(path)
    }

    /// Empty `tmp/`. Entries that cannot be removed are logged and skipped.
    pub fn cleanup_temp_files(&self) -> Result<usize, SandboxError> {
        self.ensure_open()?;
        let tmp = self.root.join("tmp");
        let entries = std::fs::read_dir(&tmp).map_err(|e| SandboxError::io(&tmp, e))?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let outcome = match entry.file_type() {
                Ok(t) if t.is_dir() => std::fs::remove_dir_all(&path),
                _ => std::fs::remove_file(&path),
            };
            match outcome {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove temp file"),
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> SandboxStatus {
        let active = !self.is_closed();
        SandboxStatus {
            active,
            name: self.name.clone(),
            root: active.then(|| self.root.clone()),
            active_processes: self.processes.len(),
            limits: self.limits,
        }
    }

    /// Terminate every process group (SIGTERM, grace period, SIGKILL) and
    /// remove the directory. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let killed = self.processes.terminate_all(self.grace_period).await;
        let removed = self.remove_dir();
        info!(name = %self.name, killed, removed, "sandbox destroyed");
        self.audit
            .log(self.entry(
                AuditEventType::SandboxDestroyed,
                json!({ "root": self.root.display().to_string(), "force_killed": killed }),
            ))
            .await;
    }

    fn ensure_open(&self) -> Result<(), SandboxError> {
        if self.is_closed() {
            return Err(SandboxError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn remove_dir(&self) -> bool {
        let dir = self.dir.lock().unwrap_or_else(|e| e.into_inner()).take();
        match dir.map(TempDir::close) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(root = %self.root.display(), error = %e, "could not remove sandbox directory");
                false
            }
            None => false,
        }
    }

    fn entry(&self, event_type: AuditEventType, details: serde_json::Value) -> AuditEntry {
        AuditEntry::new(
            event_type,
            AuditSource::new(COMPONENT).with_session(self.name.clone()),
            details,
        )
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(name = %self.name, "sandbox dropped without close; forcing cleanup");
        self.processes.kill_all_now();
        self.remove_dir();
        self.audit.try_log(self.entry(
            AuditEventType::SandboxDestroyed,
            json!({ "root": self.root.display().to_string(), "forced": true }),
        ));
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "personal_os_sandbox".to_string()
    } else {
        cleaned
    }
}
