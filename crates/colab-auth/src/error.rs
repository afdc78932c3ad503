//! Error types for login and credential handling.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// An error raised while signing in or managing credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A code is already being awaited for this nonce.
    #[error("already waiting for an authorization code with nonce {nonce}")]
    AlreadyWaiting { nonce: String },

    /// No pending wait matches this nonce.
    #[error("no pending authorization request for nonce {nonce}")]
    UnknownNonce { nonce: String },

    /// The authorization code did not arrive in time.
    #[error("timed out waiting for the authorization code")]
    Timeout,

    /// The attempt was cancelled by the user.
    #[error("sign-in was cancelled")]
    Cancelled,

    /// A callback URI arrived without a nonce.
    #[error("callback URI is missing the nonce parameter")]
    MissingNonce,

    /// A callback URI arrived without a code.
    #[error("callback URI is missing the code parameter")]
    MissingCode,

    /// No login method can run in this environment.
    #[error("no sign-in methods are available in this environment")]
    NoFlowsAvailable,

    /// The token endpoint rejected the exchange.
    #[error("token exchange failed ({status}): {message}")]
    TokenExchangeFailed { status: StatusCode, message: String },

    /// The token endpoint answered without everything a credential needs.
    #[error("token response is missing {}", .missing.join(", "))]
    IncompleteCredentials { missing: Vec<&'static str> },

    /// Every login method in the fallback chain failed.
    #[error("all sign-in methods failed: {}", summarize(.failures))]
    AllFlowsFailed { failures: Vec<FlowFailure> },

    /// The only login method failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] Box<AuthError>),

    /// No stored credentials.
    #[error("not signed in; run `colab login` first")]
    NotAuthenticated,

    /// Network error talking to the OAuth endpoints.
    #[error("network error: {0}")]
    Network(String),

    /// The OAuth endpoints returned something unparseable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Missing or invalid OAuth configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credentials could not be read or written.
    #[error("credential storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if the user cancelled rather than something failing.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::AuthenticationFailed(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Returns true if signing in again could fix this.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::IncompleteCredentials { .. })
    }
}

/// One failed attempt in the fallback chain.
#[derive(Debug)]
pub struct FlowFailure {
    /// Name of the flow that failed.
    pub flow: String,
    pub error: AuthError,
}

impl fmt::Display for FlowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.flow, self.error)
    }
}

fn summarize(failures: &[FlowFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
