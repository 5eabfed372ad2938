use std::path::PathBuf;

/// Failures to create or use a sandbox session.
///
/// Rejected, failed and timed-out commands are not errors; they are
/// reported through [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("panic mode is enabled; sandbox sessions are refused")]
    PanicMode,

    #[error("sandbox session '{0}' is closed")]
    Closed(String),

    #[error("sandbox I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
