// src/error.rs
//! Error types for ICE connection operations

use std::io;
use thiserror::Error;

use crate::ice::{ComponentId, IceState};

/// Errors returned by [`IceConnection`](crate::IceConnection) and its collaborators
#[derive(Debug, Error)]
pub enum IceError {
    /// Component id outside `1..=components`
    #[error("Unknown component {component_id} (connection has {components})")]
    InvalidComponent {
        component_id: ComponentId,
        components: u32,
    },

    /// Malformed candidate
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Some candidates of a remote batch were rejected
    #[error("Rejected {rejected} remote candidate(s), accepted {accepted}")]
    CandidatesRejected { accepted: usize, rejected: usize },

    /// Operation not allowed in the current connection state
    #[error("Operation not allowed in state {0}")]
    InvalidState(IceState),

    /// `start()` was called on a running connection
    #[error("Connection already started")]
    AlreadyStarted,

    /// The ICE engine refused the operation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Invalid construction parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IceError {
    /// Caller supplied bad input; retrying with corrected input may succeed
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidComponent { .. } |
            Self::InvalidCandidate(_) |
            Self::CandidatesRejected { .. }
        )
    }

    /// Operation was attempted at the wrong point of the connection lifecycle
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(self, Self::InvalidState(_) | Self::AlreadyStarted)
    }
}

/// Result type for ICE connection operations
pub type IceResult<T> = Result<T, IceError>;

/// Convert I/O errors to engine errors with context
pub trait IoErrorContext<T> {
    fn ice_context(self, context: &str) -> IceResult<T>;
}

impl<T> IoErrorContext<T> for io::Result<T> {
    fn ice_context(self, context: &str) -> IceResult<T> {
        self.map_err(|e| IceError::Engine(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = IceError::InvalidComponent { component_id: 3, components: 1 };
        assert!(err.is_invalid_argument());
        assert!(!err.is_lifecycle_misuse());

        let err = IceError::InvalidState(IceState::Initial);
        assert!(err.is_lifecycle_misuse());
        assert!(!err.is_invalid_argument());

        assert!(!IceError::Engine("closed".to_string()).is_invalid_argument());
    }

    #[test]
    fn test_io_context() {
        let res: io::Result<()> = Err(io::Error::new(io::ErrorKind::AddrInUse, "busy"));
        let err = res.ice_context("bind 127.0.0.1:5000").unwrap_err();
        assert!(err.to_string().contains("bind 127.0.0.1:5000"));
    }
}
