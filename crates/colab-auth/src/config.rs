//! OAuth client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthError, AuthResult};

/// OAuth 2.0 client credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Layout of a Google Cloud Console credentials download.
///
/// Accepts the nested `installed`/`web` form and the flat form gcloud writes.
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<NestedCredentials>,
    web: Option<NestedCredentials>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NestedCredentials {
    client_id: String,
    client_secret: String,
}

impl OAuthCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Loads credentials from a Google Cloud Console JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuthError::configuration(format!(
                "failed to read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parses credentials from JSON in either supported layout.
    pub fn from_json(json: &str) -> AuthResult<Self> {
        let file: CredentialsFile = serde_json::from_str(json).map_err(|e| {
            AuthError::configuration(format!("failed to parse credentials JSON: {}", e))
        })?;

        if let Some(creds) = file.installed.or(file.web) {
            return Ok(Self::new(creds.client_id, creds.client_secret));
        }

        if let (Some(client_id), Some(client_secret)) = (file.client_id, file.client_secret) {
            return Ok(Self::new(client_id, client_secret));
        }

        Err(AuthError::configuration(
            "credentials must contain an 'installed'/'web' section or top-level 'client_id'/'client_secret'",
        ))
    }

    /// Checks that the credentials look like a Google OAuth client.
    pub fn validate(&self) -> AuthResult<()> {
        if self.client_id.is_empty() {
            return Err(AuthError::configuration("client_id is required"));
        }
        if !self.client_id.ends_with(".apps.googleusercontent.com") {
            return Err(AuthError::configuration(
                "client_id should end with .apps.googleusercontent.com",
            ));
        }
        if self.client_secret.is_empty() {
            return Err(AuthError::configuration("client_secret is required"));
        }
        Ok(())
    }
}

/// Everything needed to sign in and keep credentials on disk.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub credentials: OAuthCredentials,
    /// Scopes requested on every login.
    pub scopes: Vec<String>,
    /// Intermediary page that forwards the code to `callback_uri`.
    pub redirect_uri: String,
    /// Where the intermediary sends the browser back to, as
    /// `<scheme>://<publisher.name>`.
    pub callback_uri: String,
    /// Where credentials are persisted.
    pub credentials_path: PathBuf,
    /// HTTP timeout for the token endpoint.
    pub timeout: Duration,
    /// Ports the loopback flow tries, inclusive.
    pub loopback_port_range: (u16, u16),
}

impl AuthConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_REDIRECT_URI: &'static str =
        "https://colab.research.google.com/vscode/redirect";
    pub const DEFAULT_CALLBACK_URI: &'static str = "vscode://google.colab";
    pub const DEFAULT_SCOPES: [&'static str; 3] = [
        "profile",
        "email",
        "https://www.googleapis.com/auth/colaboratory",
    ];

    pub fn new(credentials: OAuthCredentials) -> Self {
        Self {
            credentials,
            scopes: Self::DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
            redirect_uri: Self::DEFAULT_REDIRECT_URI.to_string(),
            callback_uri: Self::DEFAULT_CALLBACK_URI.to_string(),
            credentials_path: Self::default_credentials_path(),
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            loopback_port_range: (8080, 8090),
        }
    }

    /// `~/.local/share/colab/credentials.json`, or the platform data dir.
    pub fn default_credentials_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colab")
            .join("credentials.json")
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = uri.into();
        self
    }

    pub fn with_callback_uri(mut self, uri: impl Into<String>) -> Self {
        self.callback_uri = uri.into();
        self
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_loopback_port_range(mut self, start: u16, end: u16) -> Self {
        self.loopback_port_range = (start, end);
        self
    }

    /// Validates the credentials, URIs and port range.
    pub fn validate(&self) -> AuthResult<()> {
        self.credentials.validate()?;
        if self.scopes.is_empty() {
            return Err(AuthError::configuration("at least one scope is required"));
        }
        url::Url::parse(&self.redirect_uri)
            .map_err(|e| AuthError::configuration(format!("invalid redirect_uri: {}", e)))?;
        url::Url::parse(&self.callback_uri)
            .map_err(|e| AuthError::configuration(format!("invalid callback_uri: {}", e)))?;
        let (start, end) = self.loopback_port_range;
        if start > end {
            return Err(AuthError::configuration(format!(
                "invalid loopback port range {}-{}",
                start, end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> OAuthCredentials {
        OAuthCredentials::new("123.apps.googleusercontent.com", "secret")
    }

    #[test]
    fn parses_installed_layout() {
        let json = r#"{"installed":{"client_id":"a.apps.googleusercontent.com","client_secret":"s","project_id":"p"}}"#;
        let parsed = OAuthCredentials::from_json(json).unwrap();
        assert_eq!(parsed.client_id, "a.apps.googleusercontent.com");
        assert_eq!(parsed.client_secret, "s");
    }

    #[test]
    fn parses_flat_layout() {
        let json = r#"{"client_id":"b.apps.googleusercontent.com","client_secret":"t"}"#;
        let parsed = OAuthCredentials::from_json(json).unwrap();
        assert_eq!(parsed.client_secret, "t");
    }

    #[test]
    fn rejects_unknown_layout() {
        let err = OAuthCredentials::from_json(r#"{"foo":1}"#).unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[test]
    fn credentials_validation() {
        assert!(creds().validate().is_ok());
        assert!(OAuthCredentials::new("", "s").validate().is_err());
        assert!(OAuthCredentials::new("bad-id", "s").validate().is_err());
        assert!(
            OAuthCredentials::new("x.apps.googleusercontent.com", "")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn defaults() {
        let config = AuthConfig::new(creds());
        assert_eq!(config.callback_uri, "vscode://google.colab");
        assert_eq!(config.scopes.len(), 3);
        assert!(config.credentials_path.ends_with("colab/credentials.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_catches_bad_values() {
        assert!(
            AuthConfig::new(creds())
                .with_scopes(vec![])
                .validate()
                .is_err()
        );
        assert!(
            AuthConfig::new(creds())
                .with_callback_uri("not a uri")
                .validate()
                .is_err()
        );
        assert!(
            AuthConfig::new(creds())
                .with_loopback_port_range(9000, 8000)
                .validate()
                .is_err()
        );
    }
}
