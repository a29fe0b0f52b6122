use membreak_core::{CoreError, FailureKind, SessionPhase};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Domain error: {0}")]
    Core(#[from] CoreError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Collaborator {name} failed: {reason}")]
    Collaborator { name: String, reason: String },

    #[error("Session timed out in {phase} after {duration_ms}ms")]
    SessionTimeout { phase: SessionPhase, duration_ms: u64 },

    #[error("Session cancelled in {phase}")]
    Cancelled { phase: SessionPhase },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn setup(reason: impl Into<String>) -> Self {
        Self::Setup(reason.into())
    }

    pub fn collaborator(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Collaborator {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Failure kind a session ends with when this error stops its runner.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Adapter(e) => e.failure_kind(),
            Self::SessionTimeout { .. } => FailureKind::Timeout,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::Setup(_) | Self::Collaborator { .. } | Self::Io(_) | Self::Config(_) => {
                FailureKind::SetupError
            }
            Self::InvalidTransition { .. } | Self::Core(_) | Self::Serialization(_) => {
                FailureKind::ProtocolError
            }
        }
    }

    /// Whether the orchestrator may restart the whole session after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Setup(_) | Self::Collaborator { .. } | Self::Io(_) => true,
            Self::Adapter(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised by agent adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Agent API returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Agent process exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Adapter used before start")]
    NotStarted,

    #[error("Agent {0} is not configured")]
    NotConfigured(String),
}

impl AdapterError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Protocol(_) => FailureKind::ProtocolError,
            Self::NotConfigured(_) => FailureKind::SetupError,
            _ => FailureKind::AdapterError,
        }
    }

    /// Transient errors are worth a fresh session attempt; the rest would
    /// fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Spawn(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Exit { .. } | Self::Protocol(_) | Self::NotStarted | Self::NotConfigured(_) => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Errors raised while judging a finished session.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Judge backend failed: {0}")]
    Backend(String),

    #[error("Judge backend returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Could not parse judge response: {0}")]
    Parse(String),

    #[error("Invalid judge verdict: {0}")]
    Invalid(String),

    #[error("Judge did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Judging cancelled")]
    Cancelled,

    #[error("Session is not eligible for judging: {0}")]
    NotApplicable(String),
}

impl JudgeError {
    /// Retry with the same strategy is only useful for backend hiccups and
    /// malformed answers; an ineligible session stays ineligible.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotApplicable(_) | Self::Cancelled)
    }
}

impl From<CoreError> for JudgeError {
    fn from(e: CoreError) -> Self {
        Self::Invalid(e.to_string())
    }
}

impl From<reqwest::Error> for JudgeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

pub type JudgeResult<T> = std::result::Result<T, JudgeError>;
