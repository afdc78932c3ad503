//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/colab/config.toml` by default.
//!
//! `client_id` and `client_secret` support secret references:
//! - `pass::path/in/store`, resolved via `pass show`
//! - `env::VAR_NAME`, resolved from the environment
//! - plain text, used as-is

use std::path::{Path, PathBuf};
use std::time::Duration;

use colab_assignments::{ColabApiClient, FileServerStorage, KeepAliveConfig};
use colab_auth::{AuthConfig, OAuthCredentials};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the colab client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Google sign-in settings.
    pub oauth: OAuthSettings,

    /// Colab API settings.
    pub colab: ColabSettings,

    /// Background keep-alive settings.
    pub keep_alive: KeepAliveSettings,
}

impl ClientConfig {
    /// Loads configuration from the default path, or defaults if absent.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colab")
            .join("config.toml")
    }
}

/// Expands a leading `~/` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// [oauth]
// ---------------------------------------------------------------------------

/// OAuth client and sign-in settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// OAuth client ID (supports `pass::` and `env::` prefixes).
    pub client_id: Option<String>,

    /// OAuth client secret (supports `pass::` and `env::` prefixes).
    pub client_secret: Option<String>,

    pub scopes: Vec<String>,

    pub redirect_uri: String,

    pub callback_uri: String,

    /// Where credentials are stored; defaults to the data directory.
    pub credentials_path: Option<PathBuf>,

    /// Inclusive port range for the loopback sign-in.
    pub loopback_ports: [u16; 2],
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            scopes: AuthConfig::DEFAULT_SCOPES
                .iter()
                .map(ToString::to_string)
                .collect(),
            redirect_uri: AuthConfig::DEFAULT_REDIRECT_URI.to_string(),
            callback_uri: AuthConfig::DEFAULT_CALLBACK_URI.to_string(),
            credentials_path: None,
            loopback_ports: [8080, 8090],
        }
    }
}

impl OAuthSettings {
    /// Resolves `client_id` and `client_secret`, expanding secret references.
    pub fn resolve_credentials(&self) -> Result<OAuthCredentials, String> {
        let raw_id = self.client_id.as_deref().ok_or_else(|| {
            format!(
                "OAuth client not configured. Add to {}:\n  \
                 [oauth]\n  \
                 client_id = \"YOUR_ID.apps.googleusercontent.com\"\n  \
                 client_secret = \"YOUR_SECRET\"\n\n  \
                 Or run: colab login --credentials-file <path>",
                ClientConfig::default_path().display()
            )
        })?;
        let raw_secret = self
            .client_secret
            .as_deref()
            .ok_or_else(|| "client_secret is missing from [oauth] in config.toml".to_string())?;

        let client_id = crate::secret::resolve(raw_id)
            .map_err(|e| format!("failed to resolve client_id: {}", e))?;
        let client_secret = crate::secret::resolve(raw_secret)
            .map_err(|e| format!("failed to resolve client_secret: {}", e))?;

        Ok(OAuthCredentials::new(client_id, client_secret))
    }

    /// The configured credentials path, or the default one.
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(AuthConfig::default_credentials_path)
    }

    /// Builds the sign-in configuration for `credentials`.
    pub fn to_auth_config(
        &self,
        credentials: OAuthCredentials,
        timeout: Duration,
    ) -> Result<AuthConfig, String> {
        let [start, end] = self.loopback_ports;
        let config = AuthConfig::new(credentials)
            .with_scopes(self.scopes.clone())
            .with_redirect_uri(&self.redirect_uri)
            .with_callback_uri(&self.callback_uri)
            .with_credentials_path(self.credentials_path())
            .with_timeout(timeout)
            .with_loopback_port_range(start, end);
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// [colab]
// ---------------------------------------------------------------------------

/// Colab API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColabSettings {
    pub api_base_url: String,

    /// Sent as `X-Colab-Client-Agent`.
    pub client_agent: String,

    /// HTTP timeout in seconds.
    pub timeout_secs: u64,

    /// Where assigned servers are stored; defaults to the data directory.
    pub servers_path: Option<PathBuf>,
}

impl Default for ColabSettings {
    fn default() -> Self {
        Self {
            api_base_url: ColabApiClient::DEFAULT_BASE_URL.to_string(),
            client_agent: "colab-cli".to_string(),
            timeout_secs: AuthConfig::DEFAULT_TIMEOUT_SECS,
            servers_path: None,
        }
    }
}

impl ColabSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn servers_path(&self) -> PathBuf {
        self.servers_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(FileServerStorage::default_path)
    }
}

// ---------------------------------------------------------------------------
// [keep_alive]
// ---------------------------------------------------------------------------

/// Keep-alive loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub interval_secs: u64,

    /// Connections expiring within this many seconds are refreshed.
    pub refresh_margin_secs: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        let defaults = KeepAliveConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            refresh_margin_secs: defaults.refresh_margin.as_secs(),
        }
    }
}

impl KeepAliveSettings {
    pub fn to_keep_alive_config(&self) -> KeepAliveConfig {
        KeepAliveConfig::new(Duration::from_secs(self.interval_secs))
            .with_refresh_margin(Duration::from_secs(self.refresh_margin_secs))
    }
}
