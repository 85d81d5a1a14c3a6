//! Error types for replay-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using replay-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during recording or replay.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport command failed or the target detached
    #[error("Transport error: {method} - {message}")]
    Transport { method: String, message: String },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Zero matches for a locator; a normal outcome during replay
    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one element matched a locator
    #[error("Ambiguous match: {match_count} elements matched {selector}")]
    AmbiguousMatch {
        selector: String,
        match_count: usize,
    },

    /// Actionability predicates did not pass before the deadline
    #[error("Element not actionable: {reason}")]
    NotActionable { reason: String },

    /// Input dispatch command was rejected
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    /// A capture layer refused to start
    #[error("Layer '{layer}' failed to initialize: {message}")]
    InitFailed { layer: String, message: String },

    /// Evidence buffer admission refused after GC
    #[error("Evidence buffer full: {occupancy_bytes} of {limit_bytes} bytes")]
    BufferFull {
        occupancy_bytes: usize,
        limit_bytes: usize,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error.
    pub fn transport(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an ambiguous-match error.
    pub fn ambiguous(selector: impl Into<String>, match_count: usize) -> Self {
        Self::AmbiguousMatch {
            selector: selector.into(),
            match_count,
        }
    }

    /// Create a not-actionable error.
    pub fn not_actionable(reason: impl Into<String>) -> Self {
        Self::NotActionable {
            reason: reason.into(),
        }
    }

    /// Create an init-failed error.
    pub fn init_failed(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InitFailed {
            layer: layer.into(),
            message: message.into(),
        }
    }

    /// Whether a bounded retry is worthwhile for this error.
    ///
    /// Only actionability and timeout failures are transient in the
    /// sense the decision engine cares about; everything else surfaces.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotActionable { .. } | Self::Timeout { .. })
    }

    /// Short machine-readable kind, used in telemetry records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not_found",
            Self::AmbiguousMatch { .. } => "ambiguous_match",
            Self::NotActionable { .. } => "not_actionable",
            Self::DispatchFailed(_) => "dispatch_failed",
            Self::InitFailed { .. } => "init_failed",
            Self::BufferFull { .. } => "buffer_full",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error codes for the session-control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlErrorCode {
    /// A session is already running
    AlreadyRunning,
    /// No session is running
    NotRunning,
    /// The command is invalid in the current lifecycle state
    WrongMode,
    /// A critical layer failed to initialize
    InitFailed,
    /// An argument was rejected
    InvalidArg,
}

/// Error response returned by session-control commands.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ControlError {
    /// Machine-readable code
    pub code: ControlErrorCode,
    /// Human-readable description
    pub message: String,
}

impl ControlError {
    pub fn new(code: ControlErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn wrong_mode(message: impl Into<String>) -> Self {
        Self::new(ControlErrorCode::WrongMode, message)
    }

    pub fn not_running() -> Self {
        Self::new(
            ControlErrorCode::NotRunning,
            "no recording session is active",
        )
    }

    pub fn already_running() -> Self {
        Self::new(
            ControlErrorCode::AlreadyRunning,
            "a recording session is already active",
        )
    }
}
