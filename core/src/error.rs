use thiserror::Error;

/// Failures surfaced by sessions and the pool. Timeout terminations are not
/// errors; they resolve as a normal [`crate::CommandResult`] with a
/// [`crate::TerminationReason`] attached.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn shell process")]
    SpawnFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("shell process exited unexpectedly")]
    ProcessDied,

    #[error("session initialization failed: {reason}")]
    InitFailed { reason: String },

    #[error("command was cancelled before completion")]
    Cancelled,

    #[error("session is terminated")]
    SessionClosed,

    #[error("session pool is shut down")]
    PoolClosed,
}
