//! Command implementations and the wiring they share.

pub mod auth;
pub mod config;
pub mod keep_alive;
pub mod servers;

use std::sync::Arc;

use colab_assignments::{AssignmentManager, ColabApiClient, FileServerStorage};
use colab_auth::{AuthConfig, AuthSession, CredentialStorage, GoogleOAuthClient, OAuthCredentials};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::ui::StderrNotifier;

/// Builds the sign-in configuration from `config.toml`.
pub(crate) fn auth_config(
    config: &ClientConfig,
    credentials: Option<OAuthCredentials>,
) -> ClientResult<AuthConfig> {
    let credentials = match credentials {
        Some(credentials) => credentials,
        None => config
            .oauth
            .resolve_credentials()
            .map_err(ClientError::Config)?,
    };
    config
        .oauth
        .to_auth_config(credentials, config.colab.timeout())
        .map_err(ClientError::Config)
}

/// Opens the stored sign-in session.
pub(crate) fn session(auth: &AuthConfig) -> ClientResult<Arc<AuthSession>> {
    let token_client = GoogleOAuthClient::new(auth.credentials.clone(), auth.timeout)?;
    Ok(Arc::new(AuthSession::new(
        CredentialStorage::new(&auth.credentials_path),
        Arc::new(token_client),
        auth.scopes.clone(),
    )))
}

/// Builds the assignment manager over the stored session and servers file.
pub(crate) fn assignment_manager(config: &ClientConfig) -> ClientResult<Arc<AssignmentManager>> {
    let session = session(&auth_config(config, None)?)?;
    let client = ColabApiClient::new(&config.colab.api_base_url, session, config.colab.timeout())?
        .with_client_agent(&config.colab.client_agent);
    let storage = FileServerStorage::new(config.colab.servers_path());

    Ok(Arc::new(
        AssignmentManager::new(Arc::new(client), Arc::new(storage))
            .with_notifier(Arc::new(StderrNotifier))
            .with_client_agent(&config.colab.client_agent),
    ))
}
