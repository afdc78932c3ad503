//! Signed-in state: stored credentials, refresh, and logout.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::credentials::{CredentialStorage, Credentials};
use crate::error::{AuthError, AuthResult};
use crate::flows::OAuthFlow;
use crate::login::{LoginUi, login};
use crate::token_client::TokenClient;

/// Access tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Supplies bearer tokens to API clients.
pub trait AccessTokenSource: Send + Sync {
    fn access_token(&self) -> BoxFuture<'_, AuthResult<String>>;
}

/// Stored credentials plus the means to refresh or replace them.
pub struct AuthSession {
    storage: CredentialStorage,
    token_client: Arc<dyn TokenClient>,
    scopes: Vec<String>,
    refresh_lock: Mutex<()>,
}

impl AuthSession {
    /// Creates a session, loading whatever credentials are on disk.
    pub fn new(
        storage: CredentialStorage,
        token_client: Arc<dyn TokenClient>,
        scopes: Vec<String>,
    ) -> Self {
        if let Err(e) = storage.load() {
            warn!("ignoring stored credentials: {}", e);
        }
        Self {
            storage,
            token_client,
            scopes,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.storage.get()
    }

    /// Returns true if credentials are stored and cover the configured scopes.
    pub fn is_signed_in(&self) -> bool {
        !self.storage.needs_reauth(&self.scopes)
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn storage(&self) -> &CredentialStorage {
        &self.storage
    }

    /// Runs the login flows and stores the result.
    pub async fn login(
        &self,
        flows: &[Arc<dyn OAuthFlow>],
        ui: &dyn LoginUi,
    ) -> AuthResult<Credentials> {
        let credentials = login(flows, self.token_client.as_ref(), ui, &self.scopes).await?;
        self.storage.set(credentials.clone())?;
        info!("credentials saved to {:?}", self.storage.path());
        Ok(credentials)
    }

    /// Refreshes the access token now.
    pub async fn refresh(&self) -> AuthResult<Credentials> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.storage.get().ok_or(AuthError::NotAuthenticated)?;
        self.refresh_locked(&current).await
    }

    async fn refresh_locked(&self, current: &Credentials) -> AuthResult<Credentials> {
        debug!("refreshing access token");
        let refreshed = self
            .token_client
            .refresh_token(&current.refresh_token)
            .await?
            .refresh(current)?;
        self.storage.set(refreshed.clone())?;
        Ok(refreshed)
    }

    /// Forgets stored credentials.
    pub fn logout(&self) -> AuthResult<()> {
        self.storage.clear()
    }
}

impl AccessTokenSource for AuthSession {
    fn access_token(&self) -> BoxFuture<'_, AuthResult<String>> {
        Box::pin(async move {
            let _guard = self.refresh_lock.lock().await;
            let current = self.storage.get().ok_or(AuthError::NotAuthenticated)?;
            if !current.expires_within(Duration::seconds(REFRESH_MARGIN_SECS)) {
                return Ok(current.access_token);
            }
            Ok(self.refresh_locked(&current).await?.access_token)
        })
    }
}

/// A fixed token, for tools that obtain one elsewhere.
pub struct StaticToken(pub String);

impl AccessTokenSource for StaticToken {
    fn access_token(&self) -> BoxFuture<'_, AuthResult<String>> {
        let token = self.0.clone();
        Box::pin(async move { Ok(token) })
    }
}
