//! Server error types.

use crate::config::ConfigError;
use tandem_core::{DescriptionError, NodeError};
use tandem_protocol::StatusCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("invalid service: {0}")]
    Description(#[from] DescriptionError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to a wire status code.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Io(_) => StatusCode::Unavailable,
            ServerError::Node(NodeError::Closed) => StatusCode::Unavailable,
            ServerError::Node(NodeError::Connection(_)) => StatusCode::Unavailable,
            ServerError::Node(_) => StatusCode::InternalError,
            ServerError::Description(_) => StatusCode::InternalError,
            ServerError::Config(_) => StatusCode::BadRequest,
            ServerError::ShuttingDown => StatusCode::Unavailable,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.status().is_retryable()
    }
}
