use clap::{Args, Parser, Subcommand, ValueEnum};
use policy_engine::FileOp;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "guardctl",
    version,
    about = "Query and operate the personal-os security control plane"
)]
pub struct Cli {
    /// Path to the permissions file
    #[arg(short, long, env = "PERSONAL_OS_PERMISSIONS", global = true)]
    pub policy: Option<PathBuf>,

    /// Path to the credential vault (overrides the policy's credentials.vault_file)
    #[arg(long, env = "PERSONAL_OS_VAULT", global = true)]
    pub vault: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask the policy engine for a decision
    #[command(subcommand)]
    Check(CheckCommand),

    /// Operate the encrypted credential vault
    Vault(VaultArgs),

    /// Run something inside a throwaway sandbox
    #[command(subcommand)]
    Sandbox(SandboxCommand),

    /// Show policy source, panic mode and vault state
    Status,

    /// Re-read the permissions file and report whether it is valid
    Validate,
}

#[derive(Subcommand, Debug)]
pub enum CheckCommand {
    /// File access for a path
    File {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = OpArg::Read)]
        op: OpArg,
    },
    /// Web access for a domain
    Web { domain: String },
    /// Side-effecting action (consumes rate-limit budget)
    Action { action: String },
    /// Whether a program may run in a sandbox
    Command { program: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OpArg {
    Read,
    Write,
    Delete,
    Exec,
}

impl From<OpArg> for FileOp {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Read => FileOp::Read,
            OpArg::Write => FileOp::Write,
            OpArg::Delete => FileOp::Delete,
            OpArg::Exec => FileOp::Exec,
        }
    }
}

#[derive(Args, Debug)]
pub struct VaultArgs {
    /// Master password; creates the vault on first use
    #[arg(long, env = "PERSONAL_OS_MASTER_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[command(subcommand)]
    pub action: VaultAction,
}

#[derive(Subcommand, Debug)]
pub enum VaultAction {
    /// Unlock (or create) the vault and print its stats
    Unlock,
    /// Store a credential; the secret is a JSON value
    Store {
        service: String,
        identifier: String,
        #[arg(long)]
        secret: String,
    },
    /// Print a credential, or every credential of a service
    Get {
        service: String,
        identifier: Option<String>,
    },
    /// Delete a credential, or a whole service
    Delete {
        service: String,
        identifier: Option<String>,
    },
    /// List services, or the identifiers of one service
    List { service: Option<String> },
    Stats,
    /// Re-encrypt the vault under a new master password
    ChangePassword {
        #[arg(long, env = "PERSONAL_OS_NEW_MASTER_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SandboxCommand {
    /// Run a command
    Exec {
        /// Wall-clock limit in seconds (defaults to the policy's)
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run a Python snippet through the import filter
    Python {
        code: String,
        /// Allowed top-level imports (repeatable; defaults to the built-in list)
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_check_file_with_op() {
        let cli = Cli::try_parse_from([
            "guardctl", "--policy", "/tmp/p.yaml", "check", "file", "/etc/hosts", "--op", "write",
        ])
        .unwrap();
        assert_eq!(cli.policy.as_deref(), Some(std::path::Path::new("/tmp/p.yaml")));
        match cli.command {
            Command::Check(CheckCommand::File { path, op }) => {
                assert_eq!(path, PathBuf::from("/etc/hosts"));
                assert_eq!(FileOp::from(op), FileOp::Write);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sandbox_exec_keeps_hyphenated_args() {
        let cli = Cli::try_parse_from(["guardctl", "sandbox", "exec", "ls", "-la", "/tmp"]).unwrap();
        match cli.command {
            Command::Sandbox(SandboxCommand::Exec { argv, timeout }) => {
                assert_eq!(argv, ["ls", "-la", "/tmp"]);
                assert_eq!(timeout, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn vault_password_flag() {
        let cli = Cli::try_parse_from([
            "guardctl", "vault", "--password", "pw", "get", "mail", "me@example.com",
        ])
        .unwrap();
        match cli.command {
            Command::Vault(VaultArgs { password, action }) => {
                assert_eq!(password, "pw");
                assert!(matches!(
                    action,
                    VaultAction::Get { identifier: Some(ref id), .. } if id == "me@example.com"
                ));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
