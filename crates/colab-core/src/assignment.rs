//! Assigned servers, their connection information, and change events.
//!
//! A [`ColabAssignedServer`] is immutable in practice: refreshing a
//! connection produces a new record through
//! [`ColabAssignedServer::with_connection`] rather than editing one in place.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::ColabServerDescriptor;

/// Header carrying the runtime proxy token on every call to a runtime.
pub const RUNTIME_PROXY_TOKEN_HEADER: &str = "X-Colab-Runtime-Proxy-Token";

/// Header identifying the calling client to the runtime proxy.
pub const CLIENT_AGENT_HEADER: &str = "X-Colab-Client-Agent";

/// Builds the headers every runtime request must carry.
pub fn proxy_headers(token: &str, client_agent: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RUNTIME_PROXY_TOKEN_HEADER.to_string(), token.to_string()),
        (CLIENT_AGENT_HEADER.to_string(), client_agent.to_string()),
    ])
}

/// How to reach an assigned runtime.
///
/// The HTTP client used by [`fetch`](Self::fetch) is never serialized; records
/// read back from storage get a default client until rebound with
/// [`bind`](Self::bind).
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionInformation {
    /// Base URL of the runtime proxy.
    pub base_url: String,
    /// Runtime proxy token.
    pub token: String,
    /// When `token` stops being accepted.
    pub token_expiry: DateTime<Utc>,
    /// Headers attached to every request.
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    http: reqwest::Client,
}

impl ConnectionInformation {
    /// Creates connection information with freshly generated proxy headers.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        token_expiry: DateTime<Utc>,
        client_agent: &str,
    ) -> Self {
        let token = token.into();
        Self {
            base_url: base_url.into(),
            headers: proxy_headers(&token, client_agent),
            token,
            token_expiry,
            http: reqwest::Client::new(),
        }
    }

    /// Rebinds the HTTP client used by [`fetch`](Self::fetch).
    pub fn bind(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Returns true if the token is expired or expires within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.token_expiry
    }

    /// Returns true if the token is already expired.
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }

    /// Resolves `path` against the base URL. Absolute URLs pass through.
    pub fn resolve_url(&self, path: &str) -> String {
        if url::Url::parse(path).is_ok() {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Starts a request to the runtime with the proxy headers attached.
    pub fn fetch(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.headers.iter().fold(
            self.http.request(method, self.resolve_url(path)),
            |request, (name, value)| request.header(name.as_str(), value.as_str()),
        )
    }
}

impl PartialEq for ConnectionInformation {
    fn eq(&self, other: &Self) -> bool {
        self.base_url == other.base_url
            && self.token == other.token
            && self.token_expiry == other.token_expiry
            && self.headers == other.headers
    }
}

impl fmt::Debug for ConnectionInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInformation")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("token_expiry", &self.token_expiry)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A runtime assigned to the local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColabAssignedServer {
    /// Client-chosen identifier, also sent to the assignment API.
    pub id: Uuid,
    /// The shape that was requested.
    #[serde(flatten)]
    pub descriptor: ColabServerDescriptor,
    /// Remote endpoint name of the runtime.
    pub endpoint: String,
    /// How to reach the runtime.
    pub connection_information: ConnectionInformation,
    /// When the assignment was made.
    pub date_assigned: DateTime<Utc>,
}

impl ColabAssignedServer {
    /// Returns the descriptor label.
    pub fn label(&self) -> &str {
        &self.descriptor.label
    }

    /// Returns a copy of this record with new connection information.
    pub fn with_connection(&self, connection_information: ConnectionInformation) -> Self {
        Self {
            connection_information,
            ..self.clone()
        }
    }

    /// Rebinds the connection's HTTP client.
    pub fn bind(mut self, http: reqwest::Client) -> Self {
        self.connection_information = self.connection_information.bind(http);
        self
    }
}

/// A server leaving the assignment set.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedServer {
    /// The server as it was last persisted.
    pub server: ColabAssignedServer,
    /// False when the removal came from reconciliation rather than the user.
    pub user_initiated: bool,
}

/// One logical mutation of the assignment set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentChangeEvent {
    pub added: Vec<ColabAssignedServer>,
    pub removed: Vec<RemovedServer>,
    pub changed: Vec<ColabAssignedServer>,
}

impl AssignmentChangeEvent {
    /// An event announcing a new assignment.
    pub fn added(server: ColabAssignedServer) -> Self {
        Self {
            added: vec![server],
            ..Default::default()
        }
    }

    /// An event announcing a refreshed assignment.
    pub fn changed(server: ColabAssignedServer) -> Self {
        Self {
            changed: vec![server],
            ..Default::default()
        }
    }

    /// An event announcing removals.
    pub fn removed(servers: Vec<ColabAssignedServer>, user_initiated: bool) -> Self {
        Self {
            removed: servers
                .into_iter()
                .map(|server| RemovedServer {
                    server,
                    user_initiated,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Returns true if the event carries nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
