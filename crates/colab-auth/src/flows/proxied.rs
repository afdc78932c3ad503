//! Login through a hosted redirect page.
//!
//! Google redirects to an intermediary page, which forwards the browser to
//! `<scheme>://<publisher.name>?nonce=..&code=..`. Whatever owns that scheme
//! hands the URI to a [`UriHandler`]; this flow listens there and resolves
//! the matching wait.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{BrowserOpener, FlowCapabilities, FlowOptions, FlowResult, OAuthFlow};
use crate::BoxFuture;
use crate::correlator::CodeCorrelator;
use crate::error::{AuthError, AuthResult};
use crate::token_client::{AuthUrlOptions, TokenClient};

const URI_CHANNEL_CAPACITY: usize = 16;

/// Fan-out of URIs delivered to this process.
#[derive(Debug, Clone)]
pub struct UriHandler {
    tx: broadcast::Sender<Url>,
}

impl Default for UriHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl UriHandler {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(URI_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Delivers `uri` to every subscriber. Returns how many received it.
    pub fn deliver(&self, uri: Url) -> usize {
        self.tx.send(uri).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Url> {
        self.tx.subscribe()
    }
}

/// Pulls `(nonce, code)` out of a callback URI.
///
/// # Errors
///
/// [`AuthError::MissingNonce`] or [`AuthError::MissingCode`] when the
/// parameter is absent or empty.
pub fn parse_callback_uri(uri: &Url) -> AuthResult<(String, String)> {
    let param = |name: &str| {
        uri.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    };

    let nonce = param("nonce").ok_or(AuthError::MissingNonce)?;
    let code = param("code").ok_or(AuthError::MissingCode)?;
    Ok((nonce, code))
}

/// Login via the hosted redirect page and the URI handler.
pub struct ProxiedRedirectFlow {
    token_client: Arc<dyn TokenClient>,
    correlator: CodeCorrelator,
    browser: Arc<dyn BrowserOpener>,
    redirect_uri: String,
    callback_uri: Url,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ProxiedRedirectFlow {
    pub const NAME: &'static str = "proxied";

    /// Creates the flow and starts listening on `uri_handler`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        token_client: Arc<dyn TokenClient>,
        correlator: CodeCorrelator,
        browser: Arc<dyn BrowserOpener>,
        uri_handler: &UriHandler,
        redirect_uri: impl Into<String>,
        callback_uri: &str,
    ) -> AuthResult<Self> {
        let callback_uri = Url::parse(callback_uri)
            .map_err(|e| AuthError::configuration(format!("invalid callback URI: {}", e)))?;

        let listener = tokio::spawn(listen(uri_handler.subscribe(), correlator.clone()));

        Ok(Self {
            token_client,
            correlator,
            browser,
            redirect_uri: redirect_uri.into(),
            callback_uri,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Resolves the wait named by a callback URI.
    pub fn handle_uri(&self, uri: &Url) -> AuthResult<()> {
        handle_callback(&self.correlator, uri)
    }

    /// The `state` for an attempt: the callback URI carrying the nonce.
    fn state_for(&self, nonce: &str) -> Url {
        let mut state = self.callback_uri.clone();
        state.query_pairs_mut().append_pair("nonce", nonce);
        state
    }
}

fn handle_callback(correlator: &CodeCorrelator, uri: &Url) -> AuthResult<()> {
    let (nonce, code) = parse_callback_uri(uri)?;
    correlator.resolve_code(&nonce, code)
}

async fn listen(mut uris: broadcast::Receiver<Url>, correlator: CodeCorrelator) {
    loop {
        match uris.recv().await {
            Ok(uri) => match handle_callback(&correlator, &uri) {
                Ok(()) => debug!("callback URI accepted"),
                Err(e) => warn!("ignoring callback URI: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "URI listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl OAuthFlow for ProxiedRedirectFlow {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> FlowCapabilities {
        FlowCapabilities {
            supports_headless_host: true,
            supports_remote_host: true,
        }
    }

    fn trigger(&self, options: FlowOptions) -> BoxFuture<'_, AuthResult<FlowResult>> {
        let code = self
            .correlator
            .wait_for_code(options.nonce.clone(), options.cancel.clone());

        Box::pin(async move {
            let auth_url = self.token_client.generate_auth_url(&AuthUrlOptions {
                redirect_uri: self.redirect_uri.clone(),
                state: self.state_for(&options.nonce).into(),
                scopes: options.scopes,
                code_challenge: options.pkce_challenge,
            });

            info!("opening browser for sign-in");
            debug!("authorization URL: {}", auth_url);
            self.browser.open(&auth_url);

            let code = code.await?;
            Ok(FlowResult {
                code,
                redirect_uri: self.redirect_uri.clone(),
            })
        })
    }

    fn dispose(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}

impl Drop for ProxiedRedirectFlow {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::RecordingBrowser;
    use crate::pkce::PkceChallenge;
    use crate::token_client::{TokenExchange, TokenRequest};
    use tokio_util::sync::CancellationToken;

    struct UrlOnly;

    impl TokenClient for UrlOnly {
        fn generate_auth_url(&self, options: &AuthUrlOptions) -> String {
            let mut url = Url::parse("https://accounts.example.com/auth").unwrap();
            url.query_pairs_mut()
                .append_pair("redirect_uri", &options.redirect_uri)
                .append_pair("state", &options.state);
            url.into()
        }

        fn get_token(&self, _request: TokenRequest) -> BoxFuture<'_, AuthResult<TokenExchange>> {
            unreachable!()
        }

        fn refresh_token<'a>(&'a self, _: &'a str) -> BoxFuture<'a, AuthResult<TokenExchange>> {
            unreachable!()
        }
    }

    fn flow(handler: &UriHandler, browser: Arc<RecordingBrowser>) -> ProxiedRedirectFlow {
        ProxiedRedirectFlow::new(
            Arc::new(UrlOnly),
            CodeCorrelator::new(),
            browser,
            handler,
            "https://colab.research.google.com/vscode/redirect",
            "vscode://google.colab",
        )
        .unwrap()
    }

    fn options(nonce: &str, cancel: CancellationToken) -> FlowOptions {
        FlowOptions {
            cancel,
            nonce: nonce.to_string(),
            scopes: vec!["email".into()],
            pkce_challenge: PkceChallenge::generate().code_challenge,
        }
    }

    #[test]
    fn parses_callback_parameters() {
        let uri = Url::parse("vscode://google.colab?nonce=n1&code=4%2F0abc").unwrap();
        assert_eq!(
            parse_callback_uri(&uri).unwrap(),
            ("n1".to_string(), "4/0abc".to_string())
        );

        let no_nonce = Url::parse("vscode://google.colab?code=c").unwrap();
        assert!(matches!(
            parse_callback_uri(&no_nonce),
            Err(AuthError::MissingNonce)
        ));

        let no_code = Url::parse("vscode://google.colab?nonce=n&code=").unwrap();
        assert!(matches!(
            parse_callback_uri(&no_code),
            Err(AuthError::MissingCode)
        ));
    }

    #[tokio::test]
    async fn code_delivered_through_uri_handler() {
        let handler = UriHandler::new();
        let browser = Arc::new(RecordingBrowser::default());
        let flow = flow(&handler, browser.clone());

        let attempt = flow.trigger(options("nonce-1", CancellationToken::new()));
        let delivered = handler.deliver(
            Url::parse("vscode://google.colab?nonce=nonce-1&code=auth-code").unwrap(),
        );
        assert_eq!(delivered, 1);

        let result = attempt.await.unwrap();
        assert_eq!(result.code, "auth-code");
        assert_eq!(
            result.redirect_uri,
            "https://colab.research.google.com/vscode/redirect"
        );

        let opened = Url::parse(&browser.last().unwrap()).unwrap();
        let state = opened
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(state, "vscode://google.colab?nonce=nonce-1");
    }

    #[tokio::test]
    async fn handle_uri_with_unknown_nonce_fails() {
        let handler = UriHandler::new();
        let flow = flow(&handler, Arc::new(RecordingBrowser::default()));
        let uri = Url::parse("vscode://google.colab?nonce=stale&code=c").unwrap();
        assert!(matches!(
            flow.handle_uri(&uri),
            Err(AuthError::UnknownNonce { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_ends_attempt() {
        let handler = UriHandler::new();
        let flow = flow(&handler, Arc::new(RecordingBrowser::default()));
        let cancel = CancellationToken::new();

        let attempt = flow.trigger(options("n", cancel.clone()));
        cancel.cancel();
        assert!(matches!(attempt.await, Err(AuthError::Cancelled)));
    }

    #[tokio::test]
    async fn dispose_stops_listening() {
        let handler = UriHandler::new();
        let flow = flow(&handler, Arc::new(RecordingBrowser::default()));
        flow.dispose();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            handler.deliver(Url::parse("vscode://google.colab?nonce=n&code=c").unwrap()),
            0
        );
    }
}
