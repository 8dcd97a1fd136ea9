//! Error types for capture and sink pipeline operations
//!
//! Collaborators (the HTTP layer, signaling layer) match on these variants
//! to decide user-facing presentation. No variant here is fatal to the
//! whole engine; failures are isolated per capturer or per sink.

/// Error type for capturer, registry, and sink pipeline operations
#[derive(Debug, Clone)]
pub enum StreamError {
    /// External process could not be started
    SpawnFailed(String),
    /// Unknown camera id or inactive pipeline
    NotFound(String),
    /// The referenced capturer or pipeline is not running
    NotActive(String),
    /// A sink pipeline is already active for this (camera, protocol)
    AlreadyActive(String),
    /// A capturer with this id is already registered
    AlreadyExists(String),
    /// A wait window elapsed (e.g. snapshot with no frame arriving)
    Timeout,
    /// The subscription or queue was closed
    Closed,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::SpawnFailed(detail) => write!(f, "failed to spawn process: {}", detail),
            StreamError::NotFound(id) => write!(f, "camera not found: {}", id),
            StreamError::NotActive(id) => write!(f, "not running: {}", id),
            StreamError::AlreadyActive(id) => write!(f, "already active: {}", id),
            StreamError::AlreadyExists(id) => write!(f, "already exists: {}", id),
            StreamError::Timeout => write!(f, "timed out waiting for frame"),
            StreamError::Closed => write!(f, "subscription closed"),
        }
    }
}

impl std::error::Error for StreamError {}
