//! The OAuth2 token endpoint: authorization URLs, code exchange, refresh.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::BoxFuture;
use crate::config::OAuthCredentials;
use crate::credentials::Credentials;
use crate::error::{AuthError, AuthResult};
use crate::pkce::PkceChallenge;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Inputs for building an authorization URL.
#[derive(Debug, Clone)]
pub struct AuthUrlOptions {
    pub redirect_uri: String,
    /// Opaque value echoed back on redirect.
    pub state: String,
    pub scopes: Vec<String>,
    /// S256 PKCE challenge.
    pub code_challenge: String,
}

/// An authorization code exchange request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub code: String,
    pub code_verifier: String,
    /// Must equal the redirect URI used to obtain `code`.
    pub redirect_uri: String,
}

/// The token endpoint's JSON body. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: Option<i64>,
    /// Space-separated granted scopes.
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// What the token endpoint said, before any interpretation.
#[derive(Debug, Clone)]
pub struct TokenExchange {
    pub status: StatusCode,
    pub tokens: TokenResponse,
}

impl TokenExchange {
    /// Checks the status and turns a fresh grant into credentials.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenExchangeFailed`] on a non-2xx status,
    /// [`AuthError::IncompleteCredentials`] if a field is missing.
    pub fn into_credentials(self) -> AuthResult<Credentials> {
        self.ensure_success()?;
        Credentials::from_token_response(&self.tokens)
    }

    /// Applies a refresh grant to existing credentials.
    pub fn refresh(self, current: &Credentials) -> AuthResult<Credentials> {
        self.ensure_success()?;
        current.refreshed(&self.tokens)
    }

    fn ensure_success(&self) -> AuthResult<()> {
        if self.status.is_success() {
            return Ok(());
        }
        let message = match (&self.tokens.error, &self.tokens.error_description) {
            (Some(error), Some(description)) => format!("{}: {}", error, description),
            (Some(error), None) => error.clone(),
            (None, Some(description)) => description.clone(),
            (None, None) => "no error details".to_string(),
        };
        Err(AuthError::TokenExchangeFailed {
            status: self.status,
            message,
        })
    }
}

/// OAuth2 client operations the login flows depend on.
pub trait TokenClient: Send + Sync {
    /// Builds the URL the user opens to grant consent.
    fn generate_auth_url(&self, options: &AuthUrlOptions) -> String;

    /// Generates a PKCE pair for one attempt.
    fn generate_code_verifier(&self) -> PkceChallenge {
        PkceChallenge::generate()
    }

    /// Exchanges an authorization code for tokens.
    fn get_token(&self, request: TokenRequest) -> BoxFuture<'_, AuthResult<TokenExchange>>;

    /// Trades a refresh token for a new access token.
    fn refresh_token<'a>(&'a self, refresh_token: &'a str)
    -> BoxFuture<'a, AuthResult<TokenExchange>>;
}

/// [`TokenClient`] backed by Google's OAuth endpoints.
#[derive(Debug)]
pub struct GoogleOAuthClient {
    credentials: OAuthCredentials,
    http_client: reqwest::Client,
    auth_url: Url,
    token_url: String,
}

impl GoogleOAuthClient {
    pub fn new(credentials: OAuthCredentials, timeout: Duration) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            credentials,
            http_client,
            auth_url: Url::parse(GOOGLE_AUTH_URL)
                .map_err(|e| AuthError::configuration(e.to_string()))?,
            token_url: GOOGLE_TOKEN_URL.to_string(),
        })
    }

    /// Points the client at other endpoints.
    pub fn with_endpoints(
        mut self,
        auth_url: &str,
        token_url: impl Into<String>,
    ) -> AuthResult<Self> {
        self.auth_url = Url::parse(auth_url)
            .map_err(|e| AuthError::configuration(format!("invalid auth URL: {}", e)))?;
        self.token_url = token_url.into();
        Ok(self)
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> AuthResult<TokenExchange> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::network(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::network(format!("failed to read response: {}", e)))?;

        let tokens = match serde_json::from_str::<TokenResponse>(&body) {
            Ok(tokens) => tokens,
            Err(e) if status.is_success() => {
                return Err(AuthError::invalid_response(format!(
                    "invalid token response: {}",
                    e
                )));
            }
            Err(_) => TokenResponse {
                error_description: Some(body),
                ..TokenResponse::default()
            },
        };

        debug!(%status, "token endpoint responded");
        Ok(TokenExchange { status, tokens })
    }
}

impl TokenClient for GoogleOAuthClient {
    fn generate_auth_url(&self, options: &AuthUrlOptions) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("redirect_uri", &options.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &options.scopes.join(" "))
            .append_pair("code_challenge", &options.code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &options.state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        url.into()
    }

    fn get_token(&self, request: TokenRequest) -> BoxFuture<'_, AuthResult<TokenExchange>> {
        Box::pin(async move {
            info!("exchanging authorization code for tokens");
            self.post_form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("code", request.code.as_str()),
                ("code_verifier", request.code_verifier.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", request.redirect_uri.as_str()),
            ])
            .await
        })
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, AuthResult<TokenExchange>> {
        Box::pin(async move {
            debug!("refreshing access token");
            self.post_form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GoogleOAuthClient {
        GoogleOAuthClient::new(
            OAuthCredentials::new("id.apps.googleusercontent.com", "secret"),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_endpoints(
            "https://accounts.example.com/auth",
            format!("{}/token", server.uri()),
        )
        .unwrap()
    }

    fn request() -> TokenRequest {
        TokenRequest {
            code: "the-code".into(),
            code_verifier: "the-verifier".into(),
            redirect_uri: "https://colab.research.google.com/vscode/redirect".into(),
        }
    }

    #[tokio::test]
    async fn auth_url_carries_pkce_and_state() {
        let server = MockServer::start().await;
        let url = client(&server).generate_auth_url(&AuthUrlOptions {
            redirect_uri: "http://127.0.0.1:8080/callback".into(),
            state: "vscode://google.colab?nonce=abc".into(),
            scopes: vec!["profile".into(), "email".into()],
            code_challenge: "chal".into(),
        });

        let parsed = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "id.apps.googleusercontent.com");
        assert_eq!(pairs["code_challenge"], "chal");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["scope"], "profile email");
        assert_eq!(pairs["state"], "vscode://google.colab?nonce=abc");
        assert_eq!(pairs["access_type"], "offline");
    }

    #[tokio::test]
    async fn exchange_returns_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3599,
                "scope": "profile email",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchange = client(&server).get_token(request()).await.unwrap();
        assert_eq!(exchange.status, StatusCode::OK);
        let creds = exchange.into_credentials().unwrap();
        assert_eq!(creds.access_token, "at");
        assert_eq!(creds.refresh_token, "rt");
        assert_eq!(creds.scope, "profile email");
    }

    #[tokio::test]
    async fn rejected_exchange_keeps_status_and_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Bad Request"
            })))
            .mount(&server)
            .await;

        let exchange = client(&server).get_token(request()).await.unwrap();
        assert_eq!(exchange.status, StatusCode::BAD_REQUEST);
        match exchange.into_credentials() {
            Err(AuthError::TokenExchangeFailed { status, message }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "invalid_grant: Bad Request");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_json_error_body_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let exchange = client(&server).get_token(request()).await.unwrap();
        assert_eq!(
            exchange.tokens.error_description.as_deref(),
            Some("upstream down")
        );
    }

    #[tokio::test]
    async fn garbage_success_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client(&server).get_token(request()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn refresh_sends_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchange = client(&server).refresh_token("rt-1").await.unwrap();
        assert_eq!(exchange.tokens.access_token.as_deref(), Some("at-2"));
        assert!(exchange.tokens.refresh_token.is_none());
    }
}
