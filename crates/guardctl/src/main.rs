mod cli;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use audit_log::AuditSink;
use credential_vault::{CredentialVault, VaultConfig, VaultError};
use policy_engine::{AccessDecision, PolicyEngine, PolicySource, PolicyStore};
use sandbox::{ExecOptions, ExecutionResult, SandboxManager};

use crate::cli::{CheckCommand, Cli, Command, SandboxCommand, VaultAction, VaultArgs};

/// Exit status for a denied check, a failed command or a vault error.
const EXIT_REFUSED: u8 = 1;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // 1. Parse CLI args and resolve the policy file.
    let cli = Cli::parse();
    let policy_path = config::resolve_policy_path(cli.policy.as_deref());

    // 2. Load the policy. This never fails; a bad file yields the
    //    restrictive default.
    let store = Arc::new(PolicyStore::load_or_default(&policy_path));
    let audit_policy = store.snapshot().config().audit.clone();

    // 3. Init tracing-subscriber with JSON format on stderr, so stdout
    //    carries only command output.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(config::log_filter_directive(&audit_policy.log_level))
    });
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if let Some(reason) = store.fallback_reason() {
        warn!(policy_file = %policy_path.display(), %reason, "using restrictive default policy");
    }

    // 4. Start the audit trail.
    let (audit, audit_handle) = if audit_policy.enabled {
        let (sink, handle) = AuditSink::start(
            &audit_policy.log_file,
            config::audit_level(&audit_policy.log_level),
        )
        .await
        .with_context(|| {
            format!(
                "failed to start audit log at {}",
                audit_policy.log_file.display()
            )
        })?;
        (sink, Some(handle))
    } else {
        (AuditSink::disabled(), None)
    };

    // 5. Build the engine and dispatch.
    let engine = Arc::new(PolicyEngine::new(store, audit.clone()));
    info!(policy_file = %policy_path.display(), "policy engine ready");

    let outcome = dispatch(cli.command, &engine, cli.vault, &policy_path).await;

    // 6. Drop every sink clone so the writer drains and exits.
    drop(engine);
    drop(audit);
    if let Some(handle) = audit_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "audit writer task failed");
        }
    }

    outcome
}

async fn dispatch(
    command: Command,
    engine: &Arc<PolicyEngine>,
    vault_path: Option<PathBuf>,
    policy_path: &std::path::Path,
) -> Result<ExitCode> {
    match command {
        Command::Check(check) => run_check(check, engine),
        Command::Vault(args) => run_vault(args, engine, vault_path).await,
        Command::Sandbox(cmd) => run_sandbox(cmd, engine).await,
        Command::Status => run_status(engine, vault_path),
        Command::Validate => run_validate(policy_path),
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

fn run_check(check: CheckCommand, engine: &PolicyEngine) -> Result<ExitCode> {
    let decision: AccessDecision = match check {
        CheckCommand::File { path, op } => engine.check_file_access(&path, op.into()),
        CheckCommand::Web { domain } => engine.check_web_access(&domain),
        CheckCommand::Action { action } => engine.check_action_permission(&action),
        CheckCommand::Command { program } => engine.check_command(&program, None),
    };
    print_json(&decision)?;
    Ok(exit_for(decision.allowed))
}

// ---------------------------------------------------------------------------
// vault
// ---------------------------------------------------------------------------

async fn run_vault(
    args: VaultArgs,
    engine: &Arc<PolicyEngine>,
    vault_path: Option<PathBuf>,
) -> Result<ExitCode> {
    let policy = engine.credentials_policy();
    let mut vault_config = VaultConfig::from_policy(&policy);
    vault_config.path = config::resolve_vault_path(vault_path.as_deref(), &policy);
    let vault = Arc::new(CredentialVault::new(vault_config).with_policy_engine(Arc::clone(engine)));

    let VaultArgs { password, action } = args;
    let result = vault
        .blocking(move |vault| {
            vault.unlock(&password)?;
            let output = vault_action(vault, &password, action);
            vault.lock_vault();
            output
        })
        .await;

    match result {
        Ok(output) => {
            let found = !output.is_null();
            print_json(&output)?;
            Ok(exit_for(found))
        }
        Err(e) => {
            warn!(error = %e, "vault operation failed");
            print_json(&json!({ "error": e.to_string() }))?;
            Ok(ExitCode::from(EXIT_REFUSED))
        }
    }
}

fn vault_action(
    vault: &CredentialVault,
    password: &str,
    action: VaultAction,
) -> Result<serde_json::Value, VaultError> {
    let output = match action {
        VaultAction::Unlock | VaultAction::Stats => serde_json::to_value(vault.get_vault_stats())?,
        VaultAction::Store {
            service,
            identifier,
            secret,
        } => {
            // Plain strings are accepted as-is.
            let secret =
                serde_json::from_str(&secret).unwrap_or(serde_json::Value::String(secret));
            vault.store_credential(&service, &identifier, secret)?;
            json!({ "stored": true, "service": service, "identifier": identifier })
        }
        VaultAction::Get {
            service,
            identifier: Some(identifier),
        } => serde_json::to_value(vault.retrieve_credential(&service, &identifier)?)?,
        VaultAction::Get {
            service,
            identifier: None,
        } => serde_json::to_value(vault.retrieve_service(&service)?)?,
        VaultAction::Delete {
            service,
            identifier: Some(identifier),
        } => json!({ "deleted": vault.delete_credential(&service, &identifier)? }),
        VaultAction::Delete {
            service,
            identifier: None,
        } => json!({ "deleted": vault.delete_service(&service)? }),
        VaultAction::List { service: None } => serde_json::to_value(vault.list_services())?,
        VaultAction::List {
            service: Some(service),
        } => serde_json::to_value(vault.list_identifiers(&service))?,
        VaultAction::ChangePassword { new_password } => {
            vault.change_master_password(password, &new_password)?;
            json!({ "changed": true })
        }
    };
    Ok(output)
}

// ---------------------------------------------------------------------------
// sandbox
// ---------------------------------------------------------------------------

async fn run_sandbox(cmd: SandboxCommand, engine: &Arc<PolicyEngine>) -> Result<ExitCode> {
    let manager = SandboxManager::new(Arc::clone(engine));
    let result: ExecutionResult = match cmd {
        SandboxCommand::Exec { timeout, argv } => {
            let mut opts = ExecOptions::default();
            if let Some(secs) = timeout {
                opts = opts.with_timeout(Duration::from_secs(secs));
            }
            manager
                .with_sandbox("guardctl", move |session| {
                    Box::pin(async move { session.execute_command(argv.as_slice(), opts).await })
                })
                .await??
        }
        SandboxCommand::Python { code, allow } => {
            manager
                .with_sandbox("guardctl_python", move |session| {
                    Box::pin(async move {
                        let allow = (!allow.is_empty()).then_some(allow);
                        session.execute_python_code(&code, allow.as_deref()).await
                    })
                })
                .await??
        }
    };
    print_json(&result)?;
    Ok(exit_for(result.success))
}

// ---------------------------------------------------------------------------
// status / validate
// ---------------------------------------------------------------------------

fn run_status(engine: &PolicyEngine, vault_path: Option<PathBuf>) -> Result<ExitCode> {
    let snapshot = engine.snapshot();
    let policy_source = match snapshot.source() {
        PolicySource::File(path) => json!({ "kind": "file", "path": path.display().to_string() }),
        PolicySource::Inline => json!({ "kind": "inline" }),
        PolicySource::Fallback { reason } => json!({ "kind": "fallback", "reason": reason }),
    };
    let credentials = engine.credentials_policy();
    let vault_file = config::resolve_vault_path(vault_path.as_deref(), &credentials);
    let sandbox = engine.sandbox_limits();

    print_json(&json!({
        "policy": policy_source,
        "panic_mode": engine.is_panic_mode(),
        "vault": {
            "path": vault_file.display().to_string(),
            "exists": vault_file.exists(),
            "locked_out": engine.is_locked_out(credential_vault::LOCKOUT_IDENTIFIER),
        },
        "sandbox": {
            "max_memory_mb": sandbox.max_memory_mb,
            "max_cpu_seconds": sandbox.max_cpu_seconds,
            "max_file_size_mb": sandbox.max_file_size_mb,
            "execution_timeout": sandbox.execution_timeout,
        },
        "audit": {
            "enabled": engine.audit().is_enabled(),
            "log_file": snapshot.config().audit.log_file.display().to_string(),
        },
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_validate(policy_path: &std::path::Path) -> Result<ExitCode> {
    match policy_engine::loader::load_policy(policy_path) {
        Ok(_) => {
            print_json(&json!({ "valid": true, "path": policy_path.display().to_string() }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&json!({
                "valid": false,
                "path": policy_path.display().to_string(),
                "error": format!("{e:#}"),
            }))?;
            Ok(ExitCode::from(EXIT_REFUSED))
        }
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_REFUSED)
    }
}
