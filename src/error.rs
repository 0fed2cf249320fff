//! Error handling module for homebox
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Step-level failures (non-zero exits, timeouts, failed verifications) are not
//! errors: they are recorded outcomes. Everything here stops a request or a session.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code: every in-scope step succeeded or was skipped
pub const EXIT_OK: i32 = 0;
/// Exit code: blocked on a failed dependency, or a step ended failed
pub const EXIT_BLOCKED: i32 = 1;
/// Exit code: invalid step graph, steps file, or step reference
pub const EXIT_INVALID: i32 = 2;
/// Exit code: unexpected internal error (state store I/O included)
pub const EXIT_INTERNAL: i32 = 3;
/// Exit code: host missing from the steps file's host table
pub const EXIT_UNKNOWN_HOST: i32 = 4;

/// Structural problems found while loading a step graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two steps share a name
    #[error("duplicate step name '{name}'")]
    DuplicateStep { name: String },

    /// A step has an empty or whitespace-only name
    #[error("step #{index} has an empty name")]
    EmptyName { index: usize },

    /// A dependency names a step that does not exist
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    /// The dependency relation contains a cycle
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Main error type for homebox
#[derive(Error, Debug)]
pub enum HomeboxError {
    /// Step graph failed validation; the session never starts
    #[error("Invalid step graph: {0}")]
    InvalidGraph(#[from] GraphError),

    /// A request referenced a step name not in the graph
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// Host is not declared in the steps file's host table
    #[error("Host '{host}' is not declared in the steps file (declared hosts: {declared})")]
    UnknownHost { host: String, declared: String },

    /// Reading or durably writing the state file failed
    #[error("State store I/O error on {}: {source}", path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but cannot be parsed
    #[error("State file {} is corrupt: {source}", path.display())]
    StoreFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Steps file or runtime configuration problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// State errors (mutex poisoning, impossible bookkeeping)
    #[error("State error: {0}")]
    State(String),
}

/// Result type alias for homebox operations
pub type Result<T> = std::result::Result<T, HomeboxError>;

impl HomeboxError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create an unknown step error
    pub fn unknown_step(name: impl Into<String>) -> Self {
        Self::UnknownStep(name.into())
    }

    /// Wrap an I/O error with the state file it concerns
    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidGraph(_) | Self::UnknownStep(_) | Self::Config(_) => EXIT_INVALID,
            Self::UnknownHost { .. } => EXIT_UNKNOWN_HOST,
            Self::StoreIo { .. } | Self::StoreFormat { .. } | Self::State(_) => EXIT_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HomeboxError::config("missing steps array");
        assert_eq!(err.to_string(), "Configuration error: missing steps array");

        let err = HomeboxError::unknown_step("restore-dotfiles");
        assert_eq!(err.to_string(), "Unknown step: restore-dotfiles");
    }

    #[test]
    fn test_cycle_display_lists_path() {
        let err: HomeboxError = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        }
        .into();
        assert_eq!(err.to_string(), "Invalid step graph: dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_exit_codes() {
        let graph: HomeboxError = GraphError::DuplicateStep { name: "x".into() }.into();
        assert_eq!(graph.exit_code(), EXIT_INVALID);
        assert_eq!(HomeboxError::unknown_step("x").exit_code(), EXIT_INVALID);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(HomeboxError::store_io("/tmp/h.json", io).exit_code(), EXIT_INTERNAL);

        let host = HomeboxError::UnknownHost {
            host: "jay".into(),
            declared: "vimes".into(),
        };
        assert_eq!(host.exit_code(), EXIT_UNKNOWN_HOST);
    }
}
