//! Error types for runspace-coordinator.

use thiserror::Error;

use crate::engine::EngineVersion;
use crate::session::CoordinatorState;

/// Main error type for coordinator operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The engine is older than the minimum supported version.
    #[error("unsupported engine version {found}: {minimum} or newer is required")]
    UnsupportedEngineVersion {
        found: EngineVersion,
        minimum: EngineVersion,
    },

    /// The current session stopped accepting work mid-execution.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: CoordinatorState,
        to: CoordinatorState,
    },

    /// API used outside of its contract (release without acquire, resume with
    /// nothing pending, exit outside a nested prompt).
    #[error("misuse: {0}")]
    Misuse(String),

    /// The frame that owned a request was torn down before servicing it.
    #[error("frame exited before the request was serviced")]
    FrameExited,

    /// Cancelled while waiting for the session.
    #[error("operation cancelled")]
    Cancelled,

    /// The coordinator has been disposed.
    #[error("coordinator disposed")]
    Disposed,

    /// Error raised by the engine around one invocation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The identity probe returned something unusable.
    #[error("identity probe failed: {0}")]
    Probe(String),

    /// A worker thread or blocking task failed.
    #[error("worker failed: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by an engine while invoking a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Runtime failure around one invocation; converted to error text.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The pipeline was forcibly stopped mid-invocation.
    #[error("pipeline stopped")]
    Stopped,

    /// Anything else; recorded as a failed execution and returned.
    #[error("engine failure: {0}")]
    Fatal(String),
}

/// Convenience Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_version_display() {
        let err = CoordinatorError::UnsupportedEngineVersion {
            found: EngineVersion::new(3, 0),
            minimum: EngineVersion::new(5, 1),
        };
        let text = err.to_string();
        assert!(text.contains("3.0"));
        assert!(text.contains("5.1"));
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: CoordinatorError = EngineError::Fatal("host crashed".into()).into();
        assert!(matches!(err, CoordinatorError::Engine(EngineError::Fatal(_))));
        assert!(err.to_string().contains("host crashed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "spawn failed");
        let err: CoordinatorError = io_err.into();
        assert!(matches!(err, CoordinatorError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_frame_exited_display() {
        let err = CoordinatorError::FrameExited;
        assert!(err.to_string().contains("frame exited"));
    }

    #[test]
    fn test_stopped_display() {
        assert_eq!(EngineError::Stopped.to_string(), "pipeline stopped");
    }
}
