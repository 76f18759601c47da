use thiserror::Error;

use crate::types::PeerId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the registry, scheduler and aggregator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("no reliable peers available")]
    NoPeersAvailable,

    #[error("sub-task {0} timed out")]
    SubTaskTimeout(String),

    #[error("peer {0} disconnected")]
    PeerDisconnected(PeerId),

    #[error("execution provider failed: {0}")]
    ProviderFailure(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("failed to connect to {peer}: {reason}")]
    ConnectFailed { peer: PeerId, reason: String },

    #[error("sub-task {0} already has a pending assignment")]
    DuplicateAssignment(String),
}

/// Errors raised by an [`ExecutionProvider`](crate::provider::ExecutionProvider).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("process exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("provider returned no output")]
    EmptyOutput,

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("provider timed out after {0} ms")]
    TimedOut(u64),

    #[error("remote runner error: {0}")]
    Remote(String),

    #[error("{0}")]
    Io(String),
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Error::ProviderFailure(e.to_string())
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Remote(e.to_string())
    }
}
