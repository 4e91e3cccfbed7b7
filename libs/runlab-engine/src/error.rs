use runlab_common::types::Language;
use thiserror::Error;

/// Failures that are not the submitted program's fault.
///
/// Compile errors, crashes, timeouts, output-limit hits and cancellations are
/// all reported as an `ExecutionResult` instead; anything here means the host
/// or the caller is misconfigured.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("an execution is already in progress")]
    Busy,

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("failed while waiting on child process: {0}")]
    Io(#[source] std::io::Error),

    #[error("language '{0}' is not configured")]
    LanguageNotConfigured(Language),
}

impl ExecutionError {
    /// Spawn failures usually mean the toolchain is missing on this host
    pub fn is_missing_toolchain(&self) -> bool {
        matches!(self, ExecutionError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
