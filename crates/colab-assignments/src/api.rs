//! Client for the Colab runtime assignment backend.

use std::sync::Arc;
use std::time::Duration;

use colab_auth::{AccessTokenSource, BoxFuture};
use colab_core::{CLIENT_AGENT_HEADER, Variant};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AssignmentError, AssignmentResult};

/// Prefix some JSON endpoints prepend against cross-site script inclusion.
const XSSI_PREFIX: &str = ")]}'";

/// Header carrying the anti-forgery token on the assign POST.
const XSRF_HEADER: &str = "X-Goog-Colab-Token";

/// Length the notebook hash is padded to.
const NOTEBOOK_HASH_LEN: usize = 44;

/// Proxy details for reaching an assigned runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeProxyInfo {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_expires_in_seconds: i64,
    #[serde(default)]
    pub url: String,
}

/// Result of an assign call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignResponse {
    pub accelerator: Option<String>,
    pub endpoint: String,
    pub sub: Option<i64>,
    pub sub_tier: Option<i64>,
    pub variant: Option<Variant>,
    pub machine_shape: Option<i64>,
    pub runtime_proxy_info: Option<RuntimeProxyInfo>,
}

/// Compute units and accelerator eligibility for the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CcuInfo {
    pub eligible_gpus: Vec<String>,
    pub ineligible_gpus: Vec<String>,
    pub eligible_tpus: Vec<String>,
    pub ineligible_tpus: Vec<String>,
    pub current_balance: Option<f64>,
    pub consumption_rate_hourly: Option<f64>,
    pub assignments_count: Option<u32>,
}

impl CcuInfo {
    /// Returns true if `accelerator` is eligible and not ineligible.
    pub fn allows(&self, accelerator: &str) -> bool {
        let listed = |list: &[String]| list.iter().any(|a| a.eq_ignore_ascii_case(accelerator));
        (listed(&self.eligible_gpus) || listed(&self.eligible_tpus))
            && !listed(&self.ineligible_gpus)
            && !listed(&self.ineligible_tpus)
    }
}

/// A runtime the backend currently considers assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAssignment {
    pub endpoint: String,
    pub accelerator: Option<String>,
    pub variant: Option<Variant>,
    pub machine_shape: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssignmentList {
    assignments: Vec<RemoteAssignment>,
}

/// The assignment backend, as the manager sees it.
pub trait AssignmentClient: Send + Sync {
    /// Assigns (or returns the existing) runtime for `id`.
    fn assign<'a>(
        &'a self,
        id: Uuid,
        variant: Variant,
        accelerator: Option<&'a str>,
    ) -> BoxFuture<'a, AssignmentResult<AssignResponse>>;

    fn ccu_info(&self) -> BoxFuture<'_, AssignmentResult<CcuInfo>>;

    fn list_assignments(&self) -> BoxFuture<'_, AssignmentResult<Vec<RemoteAssignment>>>;

    /// Tells the backend the runtime behind `endpoint` is still in use.
    fn keep_alive<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, AssignmentResult<()>>;
}

/// Removes a leading `)]}'` line, if present.
pub fn strip_xssi_prefix(body: &str) -> &str {
    let trimmed = body.trim_start();
    trimmed
        .strip_prefix(XSSI_PREFIX)
        .map_or(trimmed, str::trim_start)
}

/// The `nbh` parameter identifying a server: its UUID with `_` for `-`,
/// padded with `.`.
pub fn notebook_hash(id: Uuid) -> String {
    let mut hash = id.to_string().replace('-', "_");
    let padding = NOTEBOOK_HASH_LEN.saturating_sub(hash.len());
    hash.extend(std::iter::repeat_n('.', padding));
    hash
}

/// [`AssignmentClient`] over HTTPS.
pub struct ColabApiClient {
    http_client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenSource>,
    client_agent: String,
}

impl ColabApiClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://colab.research.google.com";

    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn AccessTokenSource>,
        timeout: Duration,
    ) -> AssignmentResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssignmentError::network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            client_agent: "colab-cli".to_string(),
        })
    }

    pub fn with_client_agent(mut self, agent: impl Into<String>) -> Self {
        self.client_agent = agent.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/tun/m/{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> AssignmentResult<String> {
        let token = self.tokens.access_token().await?;
        let response = request
            .bearer_auth(token)
            .header(CLIENT_AGENT_HEADER, &self.client_agent)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AssignmentError::network("request timeout")
                } else if e.is_connect() {
                    AssignmentError::network(format!("connection failed: {}", e))
                } else {
                    AssignmentError::network(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AssignmentError::network(format!("failed to read response: {}", e)))?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(colab_auth::AuthError::NotAuthenticated.into());
        }
        if !status.is_success() {
            return Err(AssignmentError::Api { status, body });
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> AssignmentResult<T> {
        let body = self.send(request).await?;
        serde_json::from_str(strip_xssi_prefix(&body)).map_err(|e| {
            AssignmentError::invalid_response(format!("failed to parse response: {}", e))
        })
    }

    async fn assign_inner(
        &self,
        id: Uuid,
        variant: Variant,
        accelerator: Option<&str>,
    ) -> AssignmentResult<AssignResponse> {
        let mut query = vec![
            ("authuser", "0".to_string()),
            ("nbh", notebook_hash(id)),
        ];
        if variant != Variant::Default {
            query.push(("variant", variant.to_string()));
        }
        if let Some(accelerator) = accelerator {
            query.push(("accelerator", accelerator.to_string()));
        }

        // GET returns the existing assignment, or a token to create one.
        let probe: serde_json::Value = self
            .send_json(self.http_client.get(self.url("assign")).query(&query))
            .await?;
        if probe.get("endpoint").is_some() {
            debug!(server_id = %id, "runtime already assigned");
            return serde_json::from_value(probe).map_err(|e| {
                AssignmentError::invalid_response(format!("failed to parse assignment: {}", e))
            });
        }

        let xsrf = probe
            .get("xsrfToken")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AssignmentError::invalid_response("assign response has no xsrfToken"))?;

        debug!(server_id = %id, %variant, "requesting new runtime");
        self.send_json(
            self.http_client
                .post(self.url("assign"))
                .query(&query)
                .header(XSRF_HEADER, xsrf),
        )
        .await
    }
}

impl AssignmentClient for ColabApiClient {
    fn assign<'a>(
        &'a self,
        id: Uuid,
        variant: Variant,
        accelerator: Option<&'a str>,
    ) -> BoxFuture<'a, AssignmentResult<AssignResponse>> {
        Box::pin(self.assign_inner(id, variant, accelerator))
    }

    fn ccu_info(&self) -> BoxFuture<'_, AssignmentResult<CcuInfo>> {
        Box::pin(async move {
            self.send_json(
                self.http_client
                    .get(self.url("ccu-info"))
                    .query(&[("authuser", "0")]),
            )
            .await
        })
    }

    fn list_assignments(&self) -> BoxFuture<'_, AssignmentResult<Vec<RemoteAssignment>>> {
        Box::pin(async move {
            let list: AssignmentList = self
                .send_json(
                    self.http_client
                        .get(self.url("assignments"))
                        .query(&[("authuser", "0")]),
                )
                .await?;
            Ok(list.assignments)
        })
    }

    fn keep_alive<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, AssignmentResult<()>> {
        Box::pin(async move {
            let path = format!("{}/keep-alive/", endpoint);
            self.send(
                self.http_client
                    .get(self.url(&path))
                    .header("X-Colab-Tunnel", "Google"),
            )
            .await?;
            debug!(endpoint, "keep-alive sent");
            Ok(())
        })
    }
}
