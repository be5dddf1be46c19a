//! Error taxonomy for the backend-swap verification protocol.
//!
//! Three classes are protocol-fatal and map to distinct exit codes:
//! - [`SwapError::BackendMismatch`]: the detected backend disagrees with the
//!   phase about to run (runs invoked out of order).
//! - [`SwapError::InvariantViolation`]: a count/value checkpoint failed (a real
//!   compatibility regression across the swap).
//! - [`SwapError::DetectionFailure`]: the diagnostic log could not be used to
//!   classify the backend.
//!
//! Sentinel-level failures (`IncompletePhase`, `SentinelConflict`,
//! `CorruptSentinel`) share one exit code. Everything else is plumbing.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, SwapError>;

/// Exit code for a successful invocation.
pub const EXIT_OK: i32 = 0;
/// Exit code for command-line usage errors.
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("backend mismatch in {phase}: expected {expected} backend, detected {detected}")]
    BackendMismatch {
        phase: String,
        expected: String,
        detected: String,
    },

    #[error("invariant violation at {checkpoint}: {check} expected {expected}, got {actual}")]
    InvariantViolation {
        checkpoint: String,
        check: String,
        expected: String,
        actual: String,
    },

    #[error("backend detection failed: {0}")]
    DetectionFailure(String),

    #[error("phase {phase} was started but never committed; the database needs manual inspection")]
    IncompletePhase { phase: String },

    #[error("sentinel record changed underneath this invocation: expected state {expected}")]
    SentinelConflict { expected: String },

    #[error("sentinel record is inconsistent: {0}")]
    CorruptSentinel(String),

    #[error("duplicate key in collection {collection}: _id {id}")]
    DuplicateKey { collection: String, id: String },

    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    #[error("command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SwapError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn detection(message: impl Into<String>) -> Self {
        Self::DetectionFailure(message.into())
    }

    pub fn invariant(
        checkpoint: impl Into<String>,
        check: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::InvariantViolation {
            checkpoint: checkpoint.into(),
            check: check.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// True for the three error classes the protocol itself defines.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            Self::BackendMismatch { .. }
                | Self::InvariantViolation { .. }
                | Self::DetectionFailure(_)
        )
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BackendMismatch { .. } => 3,
            Self::InvariantViolation { .. } => 4,
            Self::DetectionFailure(_) => 5,
            Self::IncompletePhase { .. }
            | Self::SentinelConflict { .. }
            | Self::CorruptSentinel(_) => 6,
            Self::Config(_) => EXIT_USAGE,
            _ => 1,
        }
    }
}
