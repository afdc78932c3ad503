//! Login through a local HTTP server on 127.0.0.1.
//!
//! Only works when the browser runs on the same machine as this process.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BrowserOpener, FlowCapabilities, FlowOptions, FlowResult, OAuthFlow};
use crate::BoxFuture;
use crate::correlator::CodeCorrelator;
use crate::error::{AuthError, AuthResult};
use crate::token_client::{AuthUrlOptions, TokenClient};

const SUCCESS_PAGE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
    <html><body><h1>Signed in</h1>\
    <p>You can close this window and return to the terminal.</p></body></html>";

const FAILURE_PAGE: &str = "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
    <html><body><h1>Sign-in failed</h1>\
    <p>You can close this window.</p></body></html>";

const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n";

/// How long a connection may take to send its request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Login via a loopback redirect URI.
pub struct LoopbackFlow {
    token_client: Arc<dyn TokenClient>,
    correlator: CodeCorrelator,
    browser: Arc<dyn BrowserOpener>,
    port_range: (u16, u16),
}

impl LoopbackFlow {
    pub const NAME: &'static str = "loopback";

    pub fn new(
        token_client: Arc<dyn TokenClient>,
        correlator: CodeCorrelator,
        browser: Arc<dyn BrowserOpener>,
        port_range: (u16, u16),
    ) -> Self {
        Self {
            token_client,
            correlator,
            browser,
            port_range,
        }
    }
}

impl OAuthFlow for LoopbackFlow {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> FlowCapabilities {
        FlowCapabilities {
            supports_headless_host: false,
            supports_remote_host: false,
        }
    }

    fn trigger(&self, options: FlowOptions) -> BoxFuture<'_, AuthResult<FlowResult>> {
        // A denial on the consent page ends the attempt without waiting out
        // the timeout.
        let attempt = options.cancel.child_token();
        let code = self
            .correlator
            .wait_for_code(options.nonce.clone(), attempt.clone());

        Box::pin(async move {
            let (listener, port) = bind_loopback(self.port_range).await?;
            let redirect_uri = format!("http://127.0.0.1:{}/callback", port);
            let _server = AbortOnDrop(tokio::spawn(serve(
                listener,
                self.correlator.clone(),
                attempt,
            )));

            let auth_url = self.token_client.generate_auth_url(&AuthUrlOptions {
                redirect_uri: redirect_uri.clone(),
                state: options.nonce.clone(),
                scopes: options.scopes,
                code_challenge: options.pkce_challenge,
            });

            info!(port, "opening browser for sign-in");
            debug!("authorization URL: {}", auth_url);
            self.browser.open(&auth_url);

            let code = code.await?;
            Ok(FlowResult { code, redirect_uri })
        })
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Binds the first free port in the inclusive range.
async fn bind_loopback(port_range: (u16, u16)) -> AuthResult<(TcpListener, u16)> {
    for port in port_range.0..=port_range.1 {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
            debug!("bound loopback server on port {}", port);
            return Ok((listener, port));
        }
    }
    Err(AuthError::configuration(format!(
        "no available port in range {}-{}",
        port_range.0, port_range.1
    )))
}

/// Accepts connections until aborted. Each connection runs in the set, so
/// aborting the server aborts them too.
async fn serve(listener: TcpListener, correlator: CodeCorrelator, attempt: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let correlator = correlator.clone();
                    let attempt = attempt.clone();
                    connections.spawn(async move {
                        handle_connection(stream, &correlator, &attempt).await;
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    return;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Parameters the browser brings back on `/callback`.
#[derive(Debug, Default, PartialEq, Eq)]
struct Callback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Parses `GET /callback?code=..&state=.. HTTP/1.1`.
fn parse_request_line(line: &str) -> Option<Callback> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next()?;
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    if path != "/callback" {
        return None;
    }

    let mut callback = Callback::default();
    for param in query.split('&') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(&value.replace('+', " "))
            .map(|v| v.into_owned())
            .unwrap_or_default();
        match key {
            "code" => callback.code = Some(value),
            "state" => callback.state = Some(value),
            "error" => callback.error = Some(value),
            _ => {}
        }
    }
    Some(callback)
}

async fn handle_connection(
    mut stream: TcpStream,
    correlator: &CodeCorrelator,
    attempt: &CancellationToken,
) {
    let mut request_line = String::new();
    let mut reader = BufReader::new(&mut stream);
    let read = reader.read_line(&mut request_line);
    match tokio::time::timeout(REQUEST_TIMEOUT, read).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!("failed to read loopback request: {}", e);
            return;
        }
        Err(_) => {
            debug!("loopback connection sent nothing, closing");
            return;
        }
    }

    let page = match parse_request_line(&request_line) {
        None => NOT_FOUND,
        Some(Callback {
            error: Some(error), ..
        }) => {
            warn!("authorization denied: {}", error);
            attempt.cancel();
            FAILURE_PAGE
        }
        Some(Callback {
            code: Some(code),
            state: Some(state),
            ..
        }) => match correlator.resolve_code(&state, code) {
            Ok(()) => {
                debug!("loopback callback handled");
                SUCCESS_PAGE
            }
            Err(e) => {
                warn!("rejected loopback callback: {}", e);
                FAILURE_PAGE
            }
        },
        Some(_) => {
            warn!("loopback callback without code or state");
            FAILURE_PAGE
        }
    };

    let _ = stream.write_all(page.as_bytes()).await;
    let _ = stream.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::RecordingBrowser;
    use crate::token_client::{TokenExchange, TokenRequest};
    use tokio::io::AsyncReadExt;
    use url::Url;

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

    fn options(nonce: &str) -> FlowOptions {
        FlowOptions {
            cancel: CancellationToken::new(),
            nonce: nonce.to_string(),
            scopes: vec!["email".into()],
            pkce_challenge: "challenge".into(),
        }
    }

    async fn wait_for_browser(browser: &RecordingBrowser) -> Url {
        loop {
            if let Some(url) = browser.last() {
                return Url::parse(&url).unwrap();
            }
            tokio::task::yield_now().await;
        }
    }

    async fn get(redirect_uri: &str, query: &str) -> String {
        let url = Url::parse(redirect_uri).unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", url.port().unwrap()))
            .await
            .unwrap();
        stream
            .write_all(format!("GET /callback?{} HTTP/1.1\r\nHost: localhost\r\n\r\n", query).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn parses_callback_request_line() {
        let callback =
            parse_request_line("GET /callback?code=4%2F0A&state=abc HTTP/1.1\r\n").unwrap();
        assert_eq!(callback.code.as_deref(), Some("4/0A"));
        assert_eq!(callback.state.as_deref(), Some("abc"));

        let denied = parse_request_line("GET /callback?error=access_denied HTTP/1.1").unwrap();
        assert_eq!(denied.error.as_deref(), Some("access_denied"));

        assert!(parse_request_line("GET /favicon.ico HTTP/1.1").is_none());
        assert!(parse_request_line("POST /callback HTTP/1.1").is_none());
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let browser = Arc::new(RecordingBrowser::default());
        let flow = LoopbackFlow::new(
            Arc::new(UrlOnly),
            CodeCorrelator::new(),
            browser.clone(),
            (0, 0),
        );

        let attempt = tokio::spawn(async move { flow.trigger(options("nonce-7")).await });

        let opened = wait_for_browser(&browser).await;
        let pairs: std::collections::HashMap<_, _> = opened.query_pairs().into_owned().collect();
        assert_eq!(pairs["state"], "nonce-7");
        let redirect_uri = pairs["redirect_uri"].clone();
        assert!(redirect_uri.starts_with("http://127.0.0.1:"));

        let response = get(&redirect_uri, "code=abc&state=nonce-7").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let result = attempt.await.unwrap().unwrap();
        assert_eq!(result.code, "abc");
        assert_eq!(result.redirect_uri, redirect_uri);
    }

    #[tokio::test]
    async fn idle_connection_does_not_block_callback() {
        let browser = Arc::new(RecordingBrowser::default());
        let flow = LoopbackFlow::new(
            Arc::new(UrlOnly),
            CodeCorrelator::new(),
            browser.clone(),
            (0, 0),
        );

        let attempt = tokio::spawn(async move { flow.trigger(options("nonce-idle")).await });
        let opened = wait_for_browser(&browser).await;
        let redirect_uri = opened
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let port = Url::parse(&redirect_uri).unwrap().port().unwrap();

        // A preconnect that never sends a request.
        let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(3),
            get(&redirect_uri, "code=late&state=nonce-idle"),
        )
        .await
        .unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert_eq!(attempt.await.unwrap().unwrap().code, "late");
    }

    #[tokio::test]
    async fn denial_ends_attempt() {
        let browser = Arc::new(RecordingBrowser::default());
        let flow = LoopbackFlow::new(
            Arc::new(UrlOnly),
            CodeCorrelator::new(),
            browser.clone(),
            (0, 0),
        );

        let attempt = tokio::spawn(async move { flow.trigger(options("n")).await });
        let opened = wait_for_browser(&browser).await;
        let redirect_uri = opened
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let response = get(&redirect_uri, "error=access_denied").await;
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(matches!(attempt.await.unwrap(), Err(AuthError::Cancelled)));
    }

    #[test]
    fn loopback_needs_a_local_browser() {
        let flow = LoopbackFlow::new(
            Arc::new(UrlOnly),
            CodeCorrelator::new(),
            Arc::new(RecordingBrowser::default()),
            (8080, 8090),
        );
        let caps = flow.capabilities();
        assert!(!caps.supports_remote_host);
        assert!(!caps.supports_headless_host);
    }
}
