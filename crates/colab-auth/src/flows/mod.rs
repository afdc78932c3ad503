//! Pluggable strategies for obtaining an authorization code.
//!
//! A flow opens the consent page somehow and waits for the code to come back
//! through the [`CodeCorrelator`](crate::CodeCorrelator). The login
//! orchestrator tries them in order.

pub mod loopback;
pub mod proxied;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::BoxFuture;
use crate::error::AuthResult;

/// Where a flow can run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCapabilities {
    /// Works when no browser can be opened on this machine.
    pub supports_headless_host: bool,
    /// Works when this process runs on a different machine than the browser.
    pub supports_remote_host: bool,
}

impl FlowCapabilities {
    /// Returns true if the flow can run in `env`.
    pub fn supports(&self, env: &FlowEnvironment) -> bool {
        (!env.headless || self.supports_headless_host) && (!env.remote || self.supports_remote_host)
    }
}

/// Describes the host the login runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowEnvironment {
    pub headless: bool,
    pub remote: bool,
}

impl FlowEnvironment {
    /// Guesses from the process environment: SSH marks the host remote, a
    /// missing display on Linux marks it headless.
    pub fn detect() -> Self {
        let remote = std::env::var_os("SSH_CONNECTION").is_some()
            || std::env::var_os("SSH_TTY").is_some();
        let headless = cfg!(target_os = "linux")
            && std::env::var_os("DISPLAY").is_none()
            && std::env::var_os("WAYLAND_DISPLAY").is_none();
        Self { headless, remote }
    }
}

/// Inputs for one attempt.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Fires when the user gives up on this attempt.
    pub cancel: CancellationToken,
    /// Fresh per attempt; correlates the redirect with this wait.
    pub nonce: String,
    pub scopes: Vec<String>,
    /// S256 challenge of this attempt's verifier.
    pub pkce_challenge: String,
}

/// An authorization code and the redirect URI that must accompany its
/// exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResult {
    pub code: String,
    pub redirect_uri: String,
}

/// One way of obtaining an authorization code.
pub trait OAuthFlow: Send + Sync {
    /// Short name for logs and prompts.
    fn name(&self) -> &str;

    fn capabilities(&self) -> FlowCapabilities;

    /// Runs one attempt until a code arrives, the wait times out, or
    /// `options.cancel` fires.
    fn trigger(&self, options: FlowOptions) -> BoxFuture<'_, AuthResult<FlowResult>>;

    /// Releases listeners held by the flow.
    fn dispose(&self) {}
}

/// Keeps the flows that can run in `env`, in order.
pub fn available_flows(
    flows: Vec<Arc<dyn OAuthFlow>>,
    env: &FlowEnvironment,
) -> Vec<Arc<dyn OAuthFlow>> {
    flows
        .into_iter()
        .filter(|flow| flow.capabilities().supports(env))
        .collect()
}

/// Opens consent URLs for the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str);
}

/// Opens the system browser, printing the URL when that fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) {
        if let Err(e) = open::that(url) {
            warn!("failed to open browser: {}", e);
            eprintln!("\nPlease open this URL in your browser:\n\n{}\n", url);
        }
    }
}
