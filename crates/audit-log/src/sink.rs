use std::path::Path;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::entry::{AuditEntry, AuditLevel};
use crate::writer::AuditWriter;

/// Channel buffer size used between producers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Flush the writer at most every this many seconds when the channel is idle.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// A cheap, cloneable handle used to submit [`AuditEntry`] values into the
/// background audit-log writer.
///
/// `AuditSink` is `Clone + Send + Sync` so it can be shared freely between
/// the policy engine, the vault and sandbox sessions. A sink created with
/// [`AuditSink::disabled`] accepts and discards everything.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
    min_level: AuditLevel,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("enabled", &self.tx.is_some())
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl AuditSink {
    /// Spawn the background writer task and return a `(sink, join_handle)` pair.
    ///
    /// The writer opens (or creates) the file at `path` in append mode and
    /// begins draining entries from the internal channel. The background task
    /// will:
    ///
    /// * Write each entry as a JSON line via [`AuditWriter`].
    /// * Flush periodically (every ~1 second of channel inactivity).
    /// * Flush once more when the last `AuditSink` clone is dropped and the
    ///   channel closes, then exit cleanly.
    ///
    /// Entries below `min_level` are dropped before they reach the channel.
    pub async fn start(
        path: impl AsRef<Path>,
        min_level: AuditLevel,
    ) -> Result<(Self, JoinHandle<()>), crate::writer::AuditWriteError> {
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_BUFFER);

        let mut writer = AuditWriter::new(path).await?;

        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx).await;
        });

        Ok((
            Self {
                tx: Some(tx),
                min_level,
            },
            handle,
        ))
    }

    /// A sink that records nothing, used when auditing is switched off.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            min_level: AuditLevel::Error,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Send an audit entry to the background writer.
    ///
    /// If the channel is full this will wait asynchronously until space is
    /// available. If the background task has already exited the entry is
    /// dropped and a warning is logged.
    pub async fn log(&self, entry: AuditEntry) {
        let Some(tx) = self.accepting(&entry) else {
            return;
        };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(
                event_type = ?err.0.event_type,
                "audit sink channel closed; entry dropped"
            );
        }
    }

    /// Non-blocking variant of [`log`](Self::log) for synchronous callers.
    ///
    /// Never suspends. When the channel is full or closed the entry is
    /// dropped with a warning.
    pub fn try_log(&self, entry: AuditEntry) {
        let Some(tx) = self.accepting(&entry) else {
            return;
        };
        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(
                    event_type = ?entry.event_type,
                    "audit sink channel full; entry dropped"
                );
            }
            Err(TrySendError::Closed(entry)) => {
                tracing::warn!(
                    event_type = ?entry.event_type,
                    "audit sink channel closed; entry dropped"
                );
            }
        }
    }

    fn accepting(&self, entry: &AuditEntry) -> Option<&mpsc::Sender<AuditEntry>> {
        let tx = self.tx.as_ref()?;
        if entry.level < self.min_level {
            tracing::trace!(event_type = ?entry.event_type, "audit entry below minimum level");
            return None;
        }
        Some(tx)
    }
}

/// Core loop executed inside the background task.
///
/// Reads entries from the channel and writes them to the audit log. When the
/// channel has no entries ready for [`FLUSH_INTERVAL_SECS`] the writer is
/// flushed. On channel close a final flush is performed.
async fn run_writer_loop(writer: &mut AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut dirty = false;

    loop {
        let maybe_entry = tokio::time::timeout(flush_interval, rx.recv()).await;

        match maybe_entry {
            Ok(Some(entry)) => {
                if entry.event_type.is_alert() {
                    tracing::warn!(event_type = ?entry.event_type, "security alert recorded");
                }
                if let Err(err) = writer.write(&entry).await {
                    tracing::error!(%err, "failed to write audit entry");
                } else {
                    dirty = true;
                }
            }
            // Channel closed: final flush and exit.
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush audit log on shutdown");
                    }
                }
                tracing::debug!("audit writer background task shutting down");
                return;
            }
            Err(_) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "periodic audit log flush failed");
                    } else {
                        dirty = false;
                    }
                }
            }
        }
    }
}
