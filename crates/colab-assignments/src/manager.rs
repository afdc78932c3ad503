//! The assignment manager: the single writer of the assignment set.
//!
//! Every mutation takes the manager's write lock, re-reads storage, writes
//! the new set, and only then broadcasts exactly one
//! [`AssignmentChangeEvent`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use colab_core::{
    AssignmentChangeEvent, ColabAssignedServer, ColabServerDescriptor, ConnectionInformation,
    default_server, server_catalog,
};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{AssignResponse, AssignmentClient};
use crate::error::{AssignmentError, AssignmentResult};
use crate::storage::ServerStorage;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Surfaces warnings to the user.
pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str);
}

/// Sends user warnings to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn warn(&self, message: &str) {
        warn!("{}", message);
    }
}

/// Owns the set of assigned servers.
pub struct AssignmentManager {
    client: Arc<dyn AssignmentClient>,
    storage: Arc<dyn ServerStorage>,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<AssignmentChangeEvent>,
    http: reqwest::Client,
    client_agent: String,
    write_lock: Mutex<()>,
}

impl AssignmentManager {
    pub fn new(client: Arc<dyn AssignmentClient>, storage: Arc<dyn ServerStorage>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            storage,
            notifier: Arc::new(LogNotifier),
            events,
            http: reqwest::Client::new(),
            client_agent: "colab-cli".to_string(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// HTTP client bound into every record's `fetch`.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Value of the `X-Colab-Client-Agent` header on runtime requests.
    pub fn with_client_agent(mut self, agent: impl Into<String>) -> Self {
        self.client_agent = agent.into();
        self
    }

    /// Change events, one per mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<AssignmentChangeEvent> {
        self.events.subscribe()
    }

    /// Catalog shapes the user may request right now.
    ///
    /// CPU shapes always pass; accelerated shapes must be eligible and not
    /// ineligible.
    pub async fn available_server_descriptors(&self) -> AssignmentResult<Vec<ColabServerDescriptor>> {
        let ccu = self.client.ccu_info().await?;
        Ok(server_catalog()
            .into_iter()
            .filter(|descriptor| {
                descriptor
                    .accelerator
                    .as_deref()
                    .is_none_or(|accelerator| ccu.allows(accelerator))
            })
            .collect())
    }

    /// Assigns a runtime for `descriptor` under `id` and persists it.
    ///
    /// # Errors
    ///
    /// [`AssignmentError::MissingConnectionInfo`] if the backend returns no
    /// proxy URL or token; nothing is stored and no event is sent.
    pub async fn assign_server(
        &self,
        id: Uuid,
        descriptor: &ColabServerDescriptor,
    ) -> AssignmentResult<ColabAssignedServer> {
        let _guard = self.write_lock.lock().await;
        self.assign_locked(id, descriptor).await
    }

    async fn assign_locked(
        &self,
        id: Uuid,
        descriptor: &ColabServerDescriptor,
    ) -> AssignmentResult<ColabAssignedServer> {
        let response = self
            .client
            .assign(id, descriptor.variant, descriptor.accelerator.as_deref())
            .await?;
        let connection_information = self.connection_from(id, &response, None)?;

        let server = ColabAssignedServer {
            id,
            descriptor: descriptor.clone(),
            endpoint: response.endpoint,
            connection_information,
            date_assigned: Utc::now(),
        };

        let mut servers = self.storage.list().await?;
        servers.retain(|existing| existing.id != id);
        servers.push(server.clone());
        self.storage.store(servers).await?;

        info!(server_id = %id, endpoint = %server.endpoint, "assigned {}", server.label());
        self.emit(AssignmentChangeEvent::added(server.clone()));
        Ok(server)
    }

    /// Re-assigns `server_id` to obtain a fresh proxy token.
    ///
    /// Only the connection information changes; the base URL is kept.
    pub async fn refresh_connection(&self, server_id: Uuid) -> AssignmentResult<ColabAssignedServer> {
        let _guard = self.write_lock.lock().await;

        let mut servers = self.storage.list().await?;
        let slot = servers
            .iter_mut()
            .find(|server| server.id == server_id)
            .ok_or(AssignmentError::NotAssigned(server_id))?;

        let response = self
            .client
            .assign(
                server_id,
                slot.descriptor.variant,
                slot.descriptor.accelerator.as_deref(),
            )
            .await?;
        let connection = self.connection_from(
            server_id,
            &response,
            Some(&slot.connection_information.base_url),
        )?;

        let refreshed = slot.with_connection(connection);
        *slot = refreshed.clone();
        self.storage.store(servers).await?;

        debug!(server_id = %server_id, expiry = %refreshed.connection_information.token_expiry, "refreshed connection");
        self.emit(AssignmentChangeEvent::changed(refreshed.clone()));
        Ok(refreshed)
    }

    /// All stored servers, with `fetch` bound to this manager's HTTP client.
    pub async fn assigned_servers(&self) -> AssignmentResult<Vec<ColabAssignedServer>> {
        Ok(self
            .storage
            .list()
            .await?
            .into_iter()
            .map(|server| server.bind(self.http.clone()))
            .collect())
    }

    pub async fn get_server(&self, id: Uuid) -> AssignmentResult<Option<ColabAssignedServer>> {
        Ok(self
            .storage
            .get(id)
            .await?
            .map(|server| server.bind(self.http.clone())))
    }

    /// Drops stored servers the backend no longer lists, matched by endpoint.
    ///
    /// Returns the removed servers. The user is warned about each, and one
    /// event with `user_initiated: false` is sent if anything was removed.
    pub async fn reconcile_assigned_servers(&self) -> AssignmentResult<Vec<ColabAssignedServer>> {
        let _guard = self.write_lock.lock().await;

        let remote: HashSet<String> = self
            .client
            .list_assignments()
            .await?
            .into_iter()
            .map(|assignment| assignment.endpoint)
            .collect();

        let (kept, removed): (Vec<_>, Vec<_>) = self
            .storage
            .list()
            .await?
            .into_iter()
            .partition(|server| remote.contains(&server.endpoint));

        if removed.is_empty() {
            debug!(kept = kept.len(), "assignments already in sync");
            return Ok(removed);
        }

        self.storage.store(kept).await?;
        for server in &removed {
            self.notifier.warn(&format!(
                "Server \"{}\" is no longer assigned and was removed.",
                server.label()
            ));
        }

        info!(removed = removed.len(), "reconciled assignments");
        self.emit(AssignmentChangeEvent::removed(removed.clone(), false));
        Ok(removed)
    }

    /// The most recently assigned server, assigning the default shape if
    /// there is none.
    pub async fn latest_or_auto_assign_server(&self) -> AssignmentResult<ColabAssignedServer> {
        let _guard = self.write_lock.lock().await;

        let latest = self
            .storage
            .list()
            .await?
            .into_iter()
            .max_by_key(|server| server.date_assigned);
        if let Some(server) = latest {
            return Ok(server.bind(self.http.clone()));
        }

        info!("no assigned server, assigning the default");
        self.assign_locked(Uuid::new_v4(), &default_server()).await
    }

    /// Forgets `server_id`. Returns false, with no event, if it was not
    /// stored.
    pub async fn unassign_server(&self, server_id: Uuid) -> AssignmentResult<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(server) = self.storage.get(server_id).await? else {
            debug!(server_id = %server_id, "unassign of unknown server");
            return Ok(false);
        };
        if !self.storage.remove(server_id).await? {
            return Ok(false);
        }

        info!(server_id = %server_id, "unassigned {}", server.label());
        self.emit(AssignmentChangeEvent::removed(vec![server], true));
        Ok(true)
    }

    /// Pings the backend so `server` is not reclaimed as idle.
    pub async fn keep_alive(&self, server: &ColabAssignedServer) -> AssignmentResult<()> {
        self.client.keep_alive(&server.endpoint).await
    }

    fn connection_from(
        &self,
        server_id: Uuid,
        response: &AssignResponse,
        base_url: Option<&str>,
    ) -> AssignmentResult<ConnectionInformation> {
        let proxy = response
            .runtime_proxy_info
            .as_ref()
            .filter(|proxy| !proxy.url.is_empty() && !proxy.token.is_empty())
            .ok_or(AssignmentError::MissingConnectionInfo { server_id })?;

        let expiry = Duration::try_seconds(proxy.token_expires_in_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AssignmentError::invalid_response(format!(
                    "tokenExpiresInSeconds out of range: {}",
                    proxy.token_expires_in_seconds
                ))
            })?;
        Ok(ConnectionInformation::new(
            base_url.unwrap_or(proxy.url.as_str()),
            proxy.token.clone(),
            expiry,
            &self.client_agent,
        )
        .bind(self.http.clone()))
    }

    fn emit(&self, event: AssignmentChangeEvent) {
        // No subscribers is fine.
        let receivers = self.events.send(event).unwrap_or(0);
        debug!(receivers, "assignment change broadcast");
    }
}
