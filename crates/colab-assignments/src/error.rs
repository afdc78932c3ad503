//! Error types for assignment operations.

use colab_auth::AuthError;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

/// Result type for assignment operations.
pub type AssignmentResult<T> = Result<T, AssignmentError>;

/// An error raised while managing assignments.
#[derive(Debug, Error)]
pub enum AssignmentError {
    /// The backend assigned a runtime but gave no usable proxy URL or token.
    #[error("assignment for server {server_id} returned no runtime connection info")]
    MissingConnectionInfo { server_id: Uuid },

    /// The server is not in the assignment set.
    #[error("server {0} is not assigned")]
    NotAssigned(Uuid),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with a non-success status.
    #[error("Colab API error ({status}): {body}")]
    Api { status: StatusCode, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("server storage error: {0}")]
    Storage(String),
}

impl AssignmentError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if retrying later might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}
