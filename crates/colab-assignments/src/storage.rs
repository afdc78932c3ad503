//! Persistence for the assignment set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use colab_auth::BoxFuture;
use colab_core::ColabAssignedServer;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AssignmentError, AssignmentResult};

/// Storage for assigned servers.
///
/// `store` replaces the whole collection. `get` and `remove` default to a
/// read-modify-write over `list` and `store`.
pub trait ServerStorage: Send + Sync {
    fn list(&self) -> BoxFuture<'_, AssignmentResult<Vec<ColabAssignedServer>>>;

    fn store(&self, servers: Vec<ColabAssignedServer>) -> BoxFuture<'_, AssignmentResult<()>>;

    fn clear(&self) -> BoxFuture<'_, AssignmentResult<()>>;

    fn get(&self, id: Uuid) -> BoxFuture<'_, AssignmentResult<Option<ColabAssignedServer>>> {
        Box::pin(async move {
            Ok(self
                .list()
                .await?
                .into_iter()
                .find(|server| server.id == id))
        })
    }

    /// Removes `id`. Returns false if it was not stored.
    fn remove(&self, id: Uuid) -> BoxFuture<'_, AssignmentResult<bool>> {
        Box::pin(async move {
            let mut servers = self.list().await?;
            let before = servers.len();
            servers.retain(|server| server.id != id);
            if servers.len() == before {
                return Ok(false);
            }
            self.store(servers).await?;
            Ok(true)
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredServers {
    #[serde(default)]
    servers: Vec<ColabAssignedServer>,
}

/// JSON file storage. Writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileServerStorage {
    path: PathBuf,
}

impl FileServerStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/colab/servers.json`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colab")
            .join("servers.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, servers: Vec<ColabAssignedServer>) -> AssignmentResult<()> {
        let count = servers.len();
        let content = serde_json::to_vec_pretty(&StoredServers { servers })
            .map_err(|e| AssignmentError::storage(format!("failed to serialize servers: {}", e)))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || colab_core::write_private_atomic(&path, &content))
            .await
            .map_err(|e| AssignmentError::storage(format!("storage task failed: {}", e)))?
            .map_err(|e| AssignmentError::storage(format!("failed to write servers: {}", e)))?;

        debug!(count, "stored servers to {:?}", self.path);
        Ok(())
    }
}

impl ServerStorage for FileServerStorage {
    fn list(&self) -> BoxFuture<'_, AssignmentResult<Vec<ColabAssignedServer>>> {
        Box::pin(async move {
            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(AssignmentError::storage(format!(
                        "failed to read servers: {}",
                        e
                    )));
                }
            };
            let stored: StoredServers = serde_json::from_str(&content)
                .map_err(|e| AssignmentError::storage(format!("failed to parse servers: {}", e)))?;
            Ok(stored.servers)
        })
    }

    fn store(&self, servers: Vec<ColabAssignedServer>) -> BoxFuture<'_, AssignmentResult<()>> {
        Box::pin(self.write(servers))
    }

    fn clear(&self) -> BoxFuture<'_, AssignmentResult<()>> {
        Box::pin(async move {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!("removed {:?}", self.path);
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AssignmentError::storage(format!(
                    "failed to remove servers: {}",
                    e
                ))),
            }
        })
    }
}

/// In-memory storage that counts writes.
#[derive(Debug, Default)]
pub struct MemoryServerStorage {
    servers: Mutex<Vec<ColabAssignedServer>>,
    writes: AtomicUsize,
}

impl MemoryServerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store`/`clear` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn servers(&self) -> std::sync::MutexGuard<'_, Vec<ColabAssignedServer>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerStorage for MemoryServerStorage {
    fn list(&self) -> BoxFuture<'_, AssignmentResult<Vec<ColabAssignedServer>>> {
        let servers = self.servers().clone();
        Box::pin(async move { Ok(servers) })
    }

    fn store(&self, servers: Vec<ColabAssignedServer>) -> BoxFuture<'_, AssignmentResult<()>> {
        *self.servers() = servers;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn clear(&self) -> BoxFuture<'_, AssignmentResult<()>> {
        self.servers().clear();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}
