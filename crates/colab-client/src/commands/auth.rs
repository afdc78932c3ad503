//! Sign-in commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use colab_assignments::{FileServerStorage, ServerStorage};
use colab_auth::{
    BrowserOpener, CodeCorrelator, CredentialStorage, FlowEnvironment, GoogleOAuthClient,
    LoopbackFlow, OAuthCredentials, OAuthFlow, ProxiedRedirectFlow, SystemBrowser, TokenClient,
    UriHandler, available_flows,
};
use tracing::info;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::ui::TerminalUi;

/// Where the OAuth client came from.
#[derive(Debug, PartialEq)]
enum CredentialSource {
    /// `--client-id`/`--client-secret` or `--credentials-file`
    Cli,
    /// `[oauth]` in config.toml
    Config,
}

/// Signs in and stores credentials.
///
/// OAuth client values given on the command line are saved to
/// `config.toml` so later commands find them.
pub async fn login(
    client_id: Option<String>,
    client_secret: Option<String>,
    credentials_file: Option<PathBuf>,
    force: bool,
    config: &ClientConfig,
    config_path: &Path,
) -> ClientResult<()> {
    let (credentials, source) =
        resolve_oauth_client(client_id, client_secret, credentials_file, config)?;
    let auth = super::auth_config(config, Some(credentials.clone()))?;
    let session = super::session(&auth)?;

    if session.is_signed_in() && !force {
        save_client_to_config(config_path, &credentials, &source);
        println!("Already signed in.");
        println!("Use --force to sign in again.");
        return Ok(());
    }

    let token_client: Arc<dyn TokenClient> =
        Arc::new(GoogleOAuthClient::new(credentials.clone(), auth.timeout)?);
    let correlator = CodeCorrelator::new();
    let uri_handler = UriHandler::new();
    let browser: Arc<dyn BrowserOpener> = Arc::new(SystemBrowser);

    let proxied = ProxiedRedirectFlow::new(
        token_client.clone(),
        correlator.clone(),
        browser.clone(),
        &uri_handler,
        auth.redirect_uri.clone(),
        &auth.callback_uri,
    )?;
    let loopback = LoopbackFlow::new(
        token_client,
        correlator,
        browser,
        auth.loopback_port_range,
    );
    let flows: Vec<Arc<dyn OAuthFlow>> = vec![Arc::new(proxied), Arc::new(loopback)];
    let flows = available_flows(flows, &FlowEnvironment::detect());

    println!("Signing in to Google Colab...");
    println!();
    println!("A browser window will open for you to authorize access.");
    println!();

    let ui = TerminalUi::new(uri_handler);
    let result = session.login(&flows, &ui).await;
    for flow in &flows {
        flow.dispose();
    }
    let signed_in = result?;

    save_client_to_config(config_path, &credentials, &source);

    info!(expiry = %signed_in.expiry_date, "signed in");
    println!();
    println!("Signed in. Credentials saved to {}", auth.credentials_path.display());
    Ok(())
}

/// Forgets stored credentials.
pub fn logout(config: &ClientConfig) -> ClientResult<()> {
    CredentialStorage::new(config.oauth.credentials_path()).clear()?;
    println!("Signed out.");
    Ok(())
}

/// Prints sign-in state and the locally known servers. Makes no network calls.
pub async fn status(config: &ClientConfig) -> ClientResult<()> {
    match super::auth_config(config, None).and_then(|auth| super::session(&auth)) {
        Ok(session) => match session.credentials() {
            Some(credentials) if session.is_signed_in() => {
                let remaining = credentials.expiry_date - Utc::now();
                println!("Signed in.");
                if remaining.num_seconds() > 0 {
                    println!("  access token valid for {} min", remaining.num_minutes());
                } else {
                    println!("  access token expired; it is refreshed on next use");
                }
            }
            Some(_) => println!("Signed in, but missing scopes; run `colab login --force`."),
            None => println!("Not signed in; run `colab login`."),
        },
        Err(e) => println!("Not signed in: {}", e),
    }

    let storage = FileServerStorage::new(config.colab.servers_path());
    let servers = storage.list().await?;
    println!("{} assigned server(s) in {}", servers.len(), storage.path().display());
    Ok(())
}

/// Resolves the OAuth client.
///
/// Priority (highest to lowest):
/// 1. `--client-id` + `--client-secret`
/// 2. `--credentials-file` (Google Cloud Console JSON)
/// 3. `[oauth]` in config.toml
fn resolve_oauth_client(
    cli_client_id: Option<String>,
    cli_client_secret: Option<String>,
    cli_credentials_file: Option<PathBuf>,
    config: &ClientConfig,
) -> ClientResult<(OAuthCredentials, CredentialSource)> {
    if let (Some(id), Some(secret)) = (&cli_client_id, &cli_client_secret) {
        return Ok((OAuthCredentials::new(id, secret), CredentialSource::Cli));
    }

    if let Some(ref path) = cli_credentials_file {
        let credentials = OAuthCredentials::from_file(path).map_err(|e| {
            ClientError::Config(format!(
                "failed to load OAuth client from {}: {}",
                path.display(),
                e
            ))
        })?;
        return Ok((credentials, CredentialSource::Cli));
    }

    if cli_client_id.is_some() || cli_client_secret.is_some() {
        return Err(ClientError::Usage(
            "both --client-id and --client-secret are required when providing them directly"
                .to_string(),
        ));
    }

    let credentials = config
        .oauth
        .resolve_credentials()
        .map_err(ClientError::Config)?;
    Ok((credentials, CredentialSource::Config))
}

/// Writes the OAuth client into `[oauth]` of `config_path`, keeping the rest
/// of the file as it was. Only command-line values are written.
fn save_client_to_config(
    config_path: &Path,
    credentials: &OAuthCredentials,
    source: &CredentialSource,
) {
    if *source == CredentialSource::Config {
        return;
    }

    let content = std::fs::read_to_string(config_path).unwrap_or_default();
    let mut doc = match content.parse::<toml_edit::DocumentMut>() {
        Ok(doc) => doc,
        Err(e) => {
            info!("could not parse {} for writing: {}", config_path.display(), e);
            return;
        }
    };

    if !doc.contains_key("oauth") {
        doc["oauth"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    if let Some(oauth) = doc["oauth"].as_table_mut() {
        oauth["client_id"] = toml_edit::value(credentials.client_id.as_str());
        oauth["client_secret"] = toml_edit::value(credentials.client_secret.as_str());
    }

    if let Some(parent) = config_path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        info!("could not create {}: {}", parent.display(), e);
        return;
    }

    match std::fs::write(config_path, doc.to_string()) {
        Ok(()) => println!("OAuth client saved to {}", config_path.display()),
        Err(e) => info!("could not save OAuth client to {}: {}", config_path.display(), e),
    }
}
