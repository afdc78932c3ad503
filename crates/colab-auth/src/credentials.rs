//! Credentials and their on-disk store.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AuthError, AuthResult};
use crate::token_client::TokenResponse;

/// Short scope names Google expands in the granted scope string.
const SCOPE_ALIASES: [(&str, &str); 2] = [
    ("profile", "https://www.googleapis.com/auth/userinfo.profile"),
    ("email", "https://www.googleapis.com/auth/userinfo.email"),
];

/// The instant `expires_in` seconds from now.
fn expiry_after(expires_in: i64) -> AuthResult<DateTime<Utc>> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::invalid_response(format!("expires_in out of range: {}", expires_in)))
}

/// A complete OAuth2 grant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry_date: DateTime<Utc>,
    /// Space-separated granted scopes.
    pub scope: String,
}

impl Credentials {
    /// Builds credentials from a fresh authorization-code grant.
    ///
    /// Fails with [`AuthError::IncompleteCredentials`] naming every missing
    /// field.
    pub fn from_token_response(tokens: &TokenResponse) -> AuthResult<Self> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());

        let mut missing = Vec::new();
        if !present(&tokens.access_token) {
            missing.push("access_token");
        }
        if !present(&tokens.refresh_token) {
            missing.push("refresh_token");
        }
        if tokens.expires_in.is_none() {
            missing.push("expiry");
        }
        if !present(&tokens.scope) {
            missing.push("scope");
        }

        match (
            &tokens.access_token,
            &tokens.refresh_token,
            tokens.expires_in,
            &tokens.scope,
        ) {
            (Some(access), Some(refresh), Some(expires_in), Some(scope)) if missing.is_empty() => {
                Ok(Self {
                    access_token: access.clone(),
                    refresh_token: refresh.clone(),
                    expiry_date: expiry_after(expires_in)?,
                    scope: scope.clone(),
                })
            }
            _ => Err(AuthError::IncompleteCredentials { missing }),
        }
    }

    /// Applies a refresh grant. Refresh responses usually omit the refresh
    /// token and scope; those carry over.
    pub fn refreshed(&self, tokens: &TokenResponse) -> AuthResult<Self> {
        let access_token = tokens
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::IncompleteCredentials {
                missing: vec!["access_token"],
            })?;
        let expires_in = tokens.expires_in.ok_or(AuthError::IncompleteCredentials {
            missing: vec!["expiry"],
        })?;

        Ok(Self {
            access_token,
            refresh_token: tokens
                .refresh_token
                .clone()
                .unwrap_or_else(|| self.refresh_token.clone()),
            expiry_date: expiry_after(expires_in)?,
            scope: tokens.scope.clone().unwrap_or_else(|| self.scope.clone()),
        })
    }

    /// Returns true if the access token is expired or expires within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expiry_date
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }

    /// Iterates the granted scopes.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }

    /// Returns true if every scope in `required` was granted.
    pub fn has_scopes(&self, required: &[String]) -> bool {
        required.iter().all(|wanted| {
            let expanded = SCOPE_ALIASES
                .iter()
                .find(|(short, _)| short == wanted)
                .map(|(_, long)| *long);
            self.scopes()
                .any(|granted| granted == wanted || Some(granted) == expanded)
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expiry_date", &self.expiry_date)
            .field("scope", &self.scope)
            .finish()
    }
}

/// JSON file store for [`Credentials`] with an in-memory copy.
#[derive(Debug)]
pub struct CredentialStorage {
    path: PathBuf,
    credentials: RwLock<Option<Credentials>>,
}

impl CredentialStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            credentials: RwLock::new(None),
        }
    }

    /// Loads credentials from disk.
    ///
    /// Returns Ok(false) if no file exists.
    pub fn load(&self) -> AuthResult<bool> {
        if !self.path.exists() {
            debug!("no credentials file at {:?}", self.path);
            return Ok(false);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| AuthError::storage(format!("failed to read credentials: {}", e)))?;
        let credentials: Credentials = serde_json::from_str(&content)
            .map_err(|e| AuthError::storage(format!("failed to parse credentials: {}", e)))?;

        info!("loaded credentials from {:?}", self.path);
        *self.write_lock() = Some(credentials);
        Ok(true)
    }

    /// Returns a copy of the current credentials.
    pub fn get(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the credentials and persists them.
    pub fn set(&self, credentials: Credentials) -> AuthResult<()> {
        let content = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| AuthError::storage(format!("failed to serialize credentials: {}", e)))?;
        colab_core::write_private_atomic(&self.path, &content)
            .map_err(|e| AuthError::storage(format!("failed to write credentials: {}", e)))?;

        *self.write_lock() = Some(credentials);
        debug!("saved credentials to {:?}", self.path);
        Ok(())
    }

    /// Forgets the credentials in memory and on disk.
    pub fn clear(&self) -> AuthResult<()> {
        *self.write_lock() = None;
        if colab_core::remove_if_exists(&self.path)
            .map_err(|e| AuthError::storage(format!("failed to remove credentials: {}", e)))?
        {
            info!("cleared credentials from {:?}", self.path);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if stored credentials are missing or lack a scope.
    pub fn needs_reauth(&self, required_scopes: &[String]) -> bool {
        self.get()
            .is_none_or(|credentials| !credentials.has_scopes(required_scopes))
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credentials>> {
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
