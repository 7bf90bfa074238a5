//! Error types shared across the agent.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a browser connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrowserError {
    /// The page has no element matching the locator
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Browser operation timed out: {0}")]
    Timeout(String),

    /// The page refused the interaction (detached node, script error, ...)
    #[error("Interaction rejected: {0}")]
    Rejected(String),

    /// The debugging connection is gone; nothing else can be done this run
    #[error("Browser connection lost: {0}")]
    ConnectionLost(String),
}

impl BrowserError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrowserError::ConnectionLost(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("element with index {0} does not exist in the current page - retry or use an alternative element")]
    NotFound(u32),
}

/// Failures at the executor/planner model boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model request failed: {0}")]
    Transport(String),

    /// The reply did not follow the expected schema
    #[error("model reply rejected: {0}")]
    Malformed(String),

    #[error("model call timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history file {path} is not valid: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("history sequence is not strictly increasing: step {previous} followed by step {next}")]
    OutOfOrder { previous: u64, next: u64 },

    #[error("history at {0} holds no steps")]
    Empty(PathBuf),
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("browser session failed: {0}")]
    Session(#[from] BrowserError),

    #[error("cannot resume at step {seq}: {reason}")]
    ResumeIntegrity { seq: u64, reason: String },

    #[error(transparent)]
    History(#[from] HistoryError),
}
