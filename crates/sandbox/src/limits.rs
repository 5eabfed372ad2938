use std::time::Duration;

use policy_engine::SandboxPolicy;
use serde::Serialize;

const MIB: u64 = 1024 * 1024;

/// Ceilings applied to every sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_seconds: u64,
    pub max_file_size_mb: u64,
    /// Wall-clock limit; the process group is killed when it elapses.
    pub timeout: Duration,
}

impl From<&SandboxPolicy> for ResourceLimits {
    fn from(policy: &SandboxPolicy) -> Self {
        Self {
            max_memory_mb: policy.max_memory_mb,
            max_cpu_seconds: policy.max_cpu_seconds,
            max_file_size_mb: policy.max_file_size_mb,
            timeout: policy.timeout(),
        }
    }
}

impl ResourceLimits {
    /// Install the address-space, CPU-time and file-size limits in the
    /// child between fork and exec.
    #[cfg(unix)]
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        use nix::sys::resource::{setrlimit, Resource};

        let memory = self.max_memory_mb.saturating_mul(MIB);
        let cpu = self.max_cpu_seconds;
        let file_size = self.max_file_size_mb.saturating_mul(MIB);

        // SAFETY: the closure runs in the forked child before exec and only
        // calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                setrlimit(Resource::RLIMIT_AS, memory, memory)?;
                setrlimit(Resource::RLIMIT_CPU, cpu, cpu)?;
                setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size)?;
                Ok(())
            });
        }
    }

    /// OS-level ceilings are unavailable off unix; only the timeout applies.
    #[cfg(not(unix))]
    pub fn apply(&self, _cmd: &mut tokio::process::Command) {
        tracing::warn!("resource limits are not enforced on this platform");
    }
}
