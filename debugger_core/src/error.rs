use thiserror::Error;

/// Error kinds surfaced by the command layer. Everything except `Fatal` is
/// recoverable: the command is aborted, the target keeps its state.
#[derive(Debug, Error)]
pub enum DebugError {
    /// Bad address, bad id, misaligned offset
    #[error("bad address: {0}")]
    Parse(String),

    /// Unknown library, or a library that has no live mapping yet
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// The kernel rejected an attachment
    #[error("failed to install breakpoint {breakpoint}: {reason}")]
    Install { breakpoint: String, reason: String },

    /// Signal delivery hit ESRCH, the target (or one of its pids) is gone
    #[error("no such process: {0}")]
    TargetLost(u32),

    /// The command does not apply in the current run state
    #[error("{0}")]
    State(String),

    /// Startup cannot proceed
    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DebugError>;
