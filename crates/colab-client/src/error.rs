//! Client error types.

use std::fmt;

use colab_assignments::AssignmentError;
use colab_auth::AuthError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// Sign-in or token error.
    Auth(AuthError),
    /// Assignment API or storage error.
    Assignment(AssignmentError),
    /// IO error.
    Io(std::io::Error),
    /// Bad command-line input.
    Usage(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Auth(err) => write!(f, "authentication error: {}", err),
            Self::Assignment(err) => write!(f, "{}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Usage(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Auth(err) => Some(err),
            Self::Assignment(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<AuthError> for ClientError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<AssignmentError> for ClientError {
    fn from(err: AssignmentError) -> Self {
        match err {
            AssignmentError::Auth(auth) => Self::Auth(auth),
            other => Self::Assignment(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_auth_errors_are_unwrapped() {
        let err: ClientError = AssignmentError::Auth(AuthError::NotAuthenticated).into();
        assert!(matches!(err, ClientError::Auth(AuthError::NotAuthenticated)));
        assert!(err.to_string().contains("colab login"));
    }

    #[test]
    fn display_prefixes() {
        assert_eq!(
            ClientError::Config("missing client_id".into()).to_string(),
            "configuration error: missing client_id"
        );
        let err: ClientError = AssignmentError::NotAssigned(uuid::Uuid::nil()).into();
        assert!(err.to_string().starts_with("server "));
    }
}
