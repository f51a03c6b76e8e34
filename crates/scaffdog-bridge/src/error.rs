//! Error types.
//!
//! Failures crossing the channel travel as [`WireError`] data inside an
//! envelope. Everything here is local to one context.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::channel::ChannelClosed;
use crate::bridge::protocol::{Method, SessionId, WireError};
use crate::session::SessionState;

/// The two sides disagree about what is outstanding on a session.
///
/// Always a logic bug, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{session} connection state for `{method}` does not exist")]
    MissingWaiter { session: SessionId, method: Method },

    #[error("{session} already expects a `{method}` envelope")]
    DoubleRegistration { session: SessionId, method: Method },

    #[error("{session} expectation for `{method}` is already awaited")]
    DuplicateConsumer { session: SessionId, method: Method },

    #[error("idle connection does not exist (open for {session})")]
    IdlePoolEmpty { session: SessionId },

    #[error("{session} connection does not exist")]
    UnknownSession { session: SessionId },

    #[error("{session} acknowledgement without an ack tag")]
    MissingAckTag { session: SessionId },

    #[error("{session} open request received by the host")]
    UnexpectedOpen { session: SessionId },

    #[error("{session} expected a prompt reply on `{method}`, got a final turn")]
    UnexpectedTurn { session: SessionId, method: Method },

    /// Reported through a synthesized failure envelope.
    #[error("{0}")]
    Desynchronized(String),
}

impl ProtocolError {
    /// Session the failure is fatal for, when one can be named.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::MissingWaiter { session, .. }
            | Self::DoubleRegistration { session, .. }
            | Self::DuplicateConsumer { session, .. }
            | Self::UnknownSession { session }
            | Self::MissingAckTag { session }
            | Self::UnexpectedTurn { session, .. } => Some(*session),
            Self::IdlePoolEmpty { .. } | Self::UnexpectedOpen { .. } | Self::Desynchronized(_) => {
                None
            }
        }
    }
}

/// What callers of the session, connector and client APIs see.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{session} connection could not be opened due to timeout. ({}ms)", .timeout.as_millis())]
    HandshakeTimeout {
        session: SessionId,
        timeout: Duration,
    },

    #[error("protocol desynchronization: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid `{method}` payload: {source}")]
    Validation {
        method: Method,
        source: serde_json::Error,
    },

    /// Application failure reported by the peer.
    #[error("{}", .0.message)]
    Remote(WireError),

    /// The user dismissed a prompt. Informational, not a failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error("channel closed")]
    ChannelClosed,

    #[error("{session} is not active ({state:?})")]
    WrongState {
        session: SessionId,
        state: SessionState,
    },
}

impl BridgeError {
    pub fn validation(method: &Method, source: serde_json::Error) -> Self {
        Self::Validation {
            method: method.clone(),
            source,
        }
    }

    /// Classify an error received from the peer or synthesized locally.
    pub fn from_wire(error: WireError) -> Self {
        if error.is_cancelled() {
            Self::Cancelled
        } else if error.is_desync() {
            Self::Protocol(ProtocolError::Desynchronized(error.message))
        } else {
            Self::Remote(error)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Structured form for replying to the peer.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Remote(error) => error.clone(),
            Self::Cancelled => WireError::cancelled(),
            Self::Validation { .. } => WireError::new(WireError::VALIDATION, self.to_string()),
            Self::Protocol(_) => WireError::desync(self.to_string()),
            other => WireError::new("BridgeError", other.to_string()),
        }
    }
}

impl From<ChannelClosed> for BridgeError {
    fn from(_: ChannelClosed) -> Self {
        Self::ChannelClosed
    }
}

/// Failures inside the generation engine collaborator.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An input prompt was dismissed on the host.
    #[error("prompt cancelled")]
    Cancelled,

    #[error(transparent)]
    Bridge(BridgeError),

    #[error("{0}")]
    Failed(WireError),
}

impl EngineError {
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed(WireError::new(name, message))
    }

    pub fn into_wire(self) -> WireError {
        match self {
            Self::Cancelled => WireError::cancelled(),
            Self::Bridge(e) => e.to_wire(),
            Self::Failed(e) => e,
        }
    }
}

impl From<BridgeError> for EngineError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Cancelled => Self::Cancelled,
            other => Self::Bridge(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Cannot resolve scaffdog project! (searched from {})", .root.display())]
    ProjectNotFound { root: PathBuf },
}

impl From<ResolveError> for EngineError {
    fn from(error: ResolveError) -> Self {
        Self::failed("ResolveError", error.to_string())
    }
}

/// Failures of the host-side scaffolding flow.
#[derive(Debug, thiserror::Error)]
pub enum ScaffoldError {
    #[error("scaffolder is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Invalid document: \"{0}\"")]
    InvalidDocument(String),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}
