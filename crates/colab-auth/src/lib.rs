//! OAuth2 login for the colab client.
//!
//! # Architecture
//!
//! ```text
//!   browser ──► intermediary ──► scheme://publisher.name?nonce=..&code=..
//!                                             │
//!                                             ▼ UriHandler
//! ┌──────────────┐  trigger   ┌───────────────┐ resolve_code ┌────────────────┐
//! │ login()      │──────────►│ OAuthFlow     │◄────────────│ CodeCorrelator │
//! │ (fallback)   │◄──────────│ proxied/loop  │ wait_for_code│ nonce → code   │
//! └──────┬───────┘  code      └───────────────┘              └────────────────┘
//!        │ get_token(code, verifier)
//!        ▼
//! ┌──────────────┐
//! │ TokenClient  │──► Credentials ──► CredentialStorage / AuthSession
//! └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let session = AuthSession::new(storage, token_client.clone(), config.scopes.clone());
//! let flows: Vec<Arc<dyn OAuthFlow>> = vec![proxied, loopback];
//! session.login(&flows, &ui).await?;
//! let token = session.access_token().await?;
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod correlator;
pub mod credentials;
pub mod error;
pub mod flows;
pub mod login;
pub mod pkce;
pub mod session;
pub mod token_client;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::{AuthConfig, OAuthCredentials};
pub use correlator::{CODE_TIMEOUT, CodeCorrelator};
pub use credentials::{CredentialStorage, Credentials};
pub use error::{AuthError, AuthResult, FlowFailure};
pub use flows::{
    BrowserOpener, FlowCapabilities, FlowEnvironment, FlowOptions, FlowResult, OAuthFlow,
    SystemBrowser, available_flows,
    loopback::LoopbackFlow,
    proxied::{ProxiedRedirectFlow, UriHandler, parse_callback_uri},
};
pub use login::{LoginUi, ProgressGuard, login};
pub use pkce::PkceChallenge;
pub use session::{AccessTokenSource, AuthSession, StaticToken};
pub use token_client::{
    AuthUrlOptions, GoogleOAuthClient, TokenClient, TokenExchange, TokenRequest, TokenResponse,
};
