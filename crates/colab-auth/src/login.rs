//! The login orchestrator: try each flow in order, with user consent before
//! falling back, and exchange the winning code for credentials.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::BoxFuture;
use crate::credentials::Credentials;
use crate::error::{AuthError, AuthResult, FlowFailure};
use crate::flows::{FlowOptions, OAuthFlow};
use crate::token_client::{TokenClient, TokenRequest};

/// Ends a progress indicator when dropped.
pub struct ProgressGuard {
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl ProgressGuard {
    pub fn new(on_end: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_end: Some(Box::new(on_end)),
        }
    }

    /// A guard with nothing to clean up.
    pub fn noop() -> Self {
        Self { on_end: None }
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

/// What the orchestrator needs from the user interface.
pub trait LoginUi: Send + Sync {
    /// Shows that `flow` is waiting on the user. Cancelling `cancel` gives up
    /// on this attempt.
    fn progress(&self, flow: &str, cancel: CancellationToken) -> ProgressGuard;

    /// Asks whether to try `next_flow` after the previous one failed.
    fn confirm_fallback<'a>(&'a self, next_flow: &'a str) -> BoxFuture<'a, bool>;

    fn notify_error(&self, message: &str);
}

/// Signs in using the first flow that succeeds.
///
/// Each attempt gets a fresh nonce and PKCE pair. Before every attempt but
/// the first the user is asked whether to continue; declining stops the
/// chain.
///
/// # Errors
///
/// - [`AuthError::NoFlowsAvailable`] if `flows` is empty.
/// - [`AuthError::AuthenticationFailed`] wrapping the cause when the only
///   flow fails.
/// - [`AuthError::AllFlowsFailed`] listing every attempt otherwise.
pub async fn login(
    flows: &[Arc<dyn OAuthFlow>],
    token_client: &dyn TokenClient,
    ui: &dyn LoginUi,
    scopes: &[String],
) -> AuthResult<Credentials> {
    if flows.is_empty() {
        return Err(AuthError::NoFlowsAvailable);
    }

    let mut failures = Vec::new();
    for (flow, is_first) in attempts(flows) {
        if !is_first && !ui.confirm_fallback(flow.name()).await {
            info!("user declined to try {}", flow.name());
            break;
        }

        match attempt(flow.as_ref(), token_client, ui, scopes).await {
            Ok(credentials) => {
                info!(flow = flow.name(), "signed in");
                return Ok(credentials);
            }
            Err(error) => {
                warn!(flow = flow.name(), "sign-in attempt failed: {}", error);
                ui.notify_error(&format!("Sign-in with {} failed: {}", flow.name(), error));
                failures.push(FlowFailure {
                    flow: flow.name().to_string(),
                    error,
                });
            }
        }
    }

    if flows.len() == 1 {
        let cause = failures
            .pop()
            .map_or(AuthError::Cancelled, |failure| failure.error);
        return Err(AuthError::AuthenticationFailed(Box::new(cause)));
    }
    Err(AuthError::AllFlowsFailed { failures })
}

fn attempts(flows: &[Arc<dyn OAuthFlow>]) -> impl Iterator<Item = (&Arc<dyn OAuthFlow>, bool)> {
    flows.iter().enumerate().map(|(i, flow)| (flow, i == 0))
}

async fn attempt(
    flow: &dyn OAuthFlow,
    token_client: &dyn TokenClient,
    ui: &dyn LoginUi,
    scopes: &[String],
) -> AuthResult<Credentials> {
    let pkce = token_client.generate_code_verifier();
    let cancel = CancellationToken::new();

    let result = {
        let _progress = ui.progress(flow.name(), cancel.clone());
        flow.trigger(FlowOptions {
            cancel: cancel.clone(),
            nonce: Uuid::new_v4().to_string(),
            scopes: scopes.to_vec(),
            pkce_challenge: pkce.code_challenge.clone(),
        })
        .await
    };
    // Releases anything still tied to this attempt.
    cancel.cancel();

    let code = result?;
    token_client
        .get_token(TokenRequest {
            code: code.code,
            code_verifier: pkce.code_verifier,
            redirect_uri: code.redirect_uri,
        })
        .await?
        .into_credentials()
}
