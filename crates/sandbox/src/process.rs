use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Interval between liveness checks while waiting out the grace period.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process groups spawned by one sandbox session.
///
/// Every command is started as the leader of a new process group, so the
/// group id equals the child's pid and signals sent to the group also reach
/// anything the command forked.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    groups: Mutex<BTreeSet<u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pgid: u32) {
        self.lock().insert(pgid);
    }

    /// Forget `pgid` once no member of the group remains.
    pub fn release_if_gone(&self, pgid: u32) {
        if !group_alive(pgid) {
            self.lock().remove(&pgid);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// SIGTERM every group, wait up to `grace` for them to exit, then
    /// SIGKILL the survivors. Returns how many groups had to be killed.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        let groups: Vec<u32> = std::mem::take(&mut *self.lock()).into_iter().collect();
        let mut live: Vec<u32> = groups.into_iter().filter(|g| group_alive(*g)).collect();
        if live.is_empty() {
            return 0;
        }

        for pgid in &live {
            info!(pgid, "sending SIGTERM to sandbox process group");
            terminate_group(*pgid);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !live.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            live.retain(|g| group_alive(*g));
        }

        for pgid in &live {
            warn!(pgid, grace_ms = grace.as_millis() as u64, "process group did not exit; sending SIGKILL");
            kill_group(*pgid);
        }
        live.len()
    }

    /// Synchronous SIGKILL of every group, for drop paths.
    pub fn kill_all_now(&self) {
        let groups = std::mem::take(&mut *self.lock());
        for pgid in groups {
            debug!(pgid, "killing sandbox process group");
            kill_group(pgid);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(unix)]
mod signals {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    /// Group ids 0 and 1 would address our own group or init.
    fn pgid(raw: u32) -> Option<Pid> {
        i32::try_from(raw).ok().filter(|p| *p > 1).map(Pid::from_raw)
    }

    pub fn group_alive(raw: u32) -> bool {
        let Some(pgid) = pgid(raw) else {
            return false;
        };
        matches!(killpg(pgid, None), Ok(()) | Err(Errno::EPERM))
    }

    pub fn terminate_group(raw: u32) {
        if let Some(pgid) = pgid(raw) {
            let _ = killpg(pgid, Signal::SIGTERM);
        }
    }

    pub fn kill_group(raw: u32) {
        if let Some(pgid) = pgid(raw) {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

// Off unix the child handle's kill-on-drop is the only teardown.
#[cfg(not(unix))]
mod signals {
    pub fn group_alive(_raw: u32) -> bool {
        false
    }

    pub fn terminate_group(_raw: u32) {}

    pub fn kill_group(_raw: u32) {}
}

pub(crate) use signals::{group_alive, kill_group, terminate_group};
