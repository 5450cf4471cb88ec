// Error taxonomy shared by every backend and the engine itself.
//
// All variants are cheap to clone: single-flight index builds broadcast
// their outcome to every waiting caller, so build failures must be
// clonable values rather than one-shot error objects.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Non-overload HTTP failure surfaced by the remote API.
    #[error("remote api error ({status} {code}): {message}")]
    RemoteApi { status: u16, code: String, message: String },

    /// Retries exhausted under sustained remote overload.
    #[error("rate limited by remote api after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    /// A move that would make an item its own ancestor.
    #[error("cycle detected: moving `{id}` under `{new_parent_id}` would make it its own ancestor")]
    CycleDetected { id: String, new_parent_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend is read-only: {0}")]
    ReadOnly(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation this backend cannot perform (capability gap, not a failure).
    #[error("not supported by this backend: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RemoteApi { .. } => ErrorKind::RemoteApi,
            Self::RateLimitExhausted { .. } => ErrorKind::RateLimitExhausted,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ReadOnly(_) => ErrorKind::ReadOnly,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Config(_) => ErrorKind::Config,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Snapshot(_) => ErrorKind::Snapshot,
        }
    }
}

/// Stable machine-readable discriminant, suitable for wire envelopes and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RemoteApi,
    RateLimitExhausted,
    CycleDetected,
    NotFound,
    Conflict,
    ReadOnly,
    PermissionDenied,
    Unsupported,
    Config,
    Transport,
    Snapshot,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RemoteApi => "REMOTE_API_ERROR",
            Self::RateLimitExhausted => "RATE_LIMITED",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::ReadOnly => "READ_ONLY",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Config => "CONFIG",
            Self::Transport => "TRANSPORT",
            Self::Snapshot => "SNAPSHOT",
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimitExhausted | Self::Transport | Self::Snapshot)
    }
}
