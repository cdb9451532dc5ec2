// src/core/errors.rs

//! Defines the primary error type for the connection fabric.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing all failures surfaced by this crate.
///
/// The type is `Clone` so that a single session-creation failure can be
/// delivered to every caller waiting on the same in-flight attempt.
#[derive(Error, Debug, Clone)]
pub enum HubMuxError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Operation attempted after close")]
    Disposed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl HubMuxError {
    /// Fatal errors are never swallowed, retried, or converted into a
    /// cleanup path; every other variant is recoverable at some layer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HubMuxError::Fatal(_))
    }
}

impl From<std::io::Error> for HubMuxError {
    fn from(e: std::io::Error) -> Self {
        HubMuxError::Io(Arc::new(e))
    }
}

impl From<url::ParseError> for HubMuxError {
    fn from(e: url::ParseError) -> Self {
        HubMuxError::InvalidCredential(e.to_string())
    }
}
