//! Error types for the mission commander
//!
//! - Mission-level failures (`MissionError`)
//! - Failures reported by external collaborators (`CollaboratorError`)
//! - Configuration loading and validation (`ConfigError`)
//!
//! Vendor conflicts are signals, not errors, and never appear here.

use std::path::PathBuf;

use dart_kernel::StateMachineError;

/// Mission-level error
#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    /// A collaborator could not be reached
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        /// Which collaborator failed
        collaborator: &'static str,
        /// Last reported reason
        reason: String,
    },

    /// Retries of an operation ran out
    #[error("{operation} unavailable after {attempts} attempt(s): {last_error}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    /// Human denied the proposal
    #[error("remediation denied: {rationale}")]
    GateDenied { rationale: String },

    /// Loop budget spent
    #[error("loop budget exceeded (max loops: {max_loops})")]
    LoopExceeded { max_loops: u32 },

    /// Mission cancellation token fired
    #[error("mission cancelled")]
    Cancelled,

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Stage table violation
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl MissionError {
    /// Whether this terminates the mission outright
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LoopExceeded { .. } | Self::Cancelled | Self::Config(_) | Self::StateMachine(_)
        )
    }
}

/// Error reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Backend down or refused the call
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Deadline passed
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CollaboratorError {
    /// Shorthand for `Unavailable`
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Extension is neither TOML nor YAML
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(PathBuf),

    /// A field holds an out-of-range value
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_exceeded_and_cancellation_are_fatal() {
        assert!(MissionError::LoopExceeded { max_loops: 3 }.is_fatal());
        assert!(MissionError::Cancelled.is_fatal());
    }

    #[test]
    fn degraded_collaborators_are_not_fatal() {
        let err = MissionError::Unavailable {
            collaborator: "reasoning",
            reason: "connection refused".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "reasoning unavailable: connection refused");

        let err = MissionError::Exhausted {
            operation: "reasoning",
            attempts: 3,
            last_error: "timed out after 80ms".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "reasoning unavailable after 3 attempt(s): timed out after 80ms");
        assert!(!MissionError::GateDenied { rationale: "no".into() }.is_fatal());
    }

    #[test]
    fn collaborator_errors_render_their_cause() {
        assert_eq!(CollaboratorError::Timeout { after_ms: 10 }.to_string(), "timed out after 10ms");
        assert_eq!(CollaboratorError::unavailable("refused").to_string(), "unavailable: refused");
    }
}
