//! Durable record of the members of one cohort.

use crate::{Result, StorageError};
use async_trait::async_trait;
use cohort_types::MemberRegistration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Store for this member's own registration and its peers' registrations.
///
/// Remote registrations are keyed by metadata collection id.
#[async_trait]
pub trait CohortRegistryStore: Send + Sync {
    /// Saves this member's registration.
    async fn save_local_registration(&self, registration: &MemberRegistration) -> Result<()>;

    /// Retrieves this member's registration.
    async fn retrieve_local_registration(&self) -> Result<Option<MemberRegistration>>;

    /// Removes this member's registration.
    async fn remove_local_registration(&self) -> Result<()>;

    /// Inserts or replaces a peer registration.
    async fn save_remote_registration(&self, registration: &MemberRegistration) -> Result<()>;

    /// Retrieves a peer registration.
    async fn retrieve_remote_registration(
        &self,
        metadata_collection_id: &str,
    ) -> Result<Option<MemberRegistration>>;

    /// Retrieves every peer registration.
    async fn retrieve_remote_registrations(&self) -> Result<Vec<MemberRegistration>>;

    /// Removes a peer registration. Returns true if it existed.
    async fn remove_remote_registration(&self, metadata_collection_id: &str) -> Result<bool>;
}

fn remote_key(registration: &MemberRegistration) -> Result<String> {
    registration
        .metadata_collection_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StorageError::InvalidKey("registration has no metadata collection id".into()))
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryContents {
    #[serde(default)]
    local: Option<MemberRegistration>,
    #[serde(default)]
    remote: BTreeMap<String, MemberRegistration>,
}

/// An in-memory registry store.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    contents: RwLock<RegistryContents>,
}

impl MemoryRegistryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CohortRegistryStore for MemoryRegistryStore {
    async fn save_local_registration(&self, registration: &MemberRegistration) -> Result<()> {
        self.contents.write().local = Some(registration.clone());
        Ok(())
    }

    async fn retrieve_local_registration(&self) -> Result<Option<MemberRegistration>> {
        Ok(self.contents.read().local.clone())
    }

    async fn remove_local_registration(&self) -> Result<()> {
        self.contents.write().local = None;
        Ok(())
    }

    async fn save_remote_registration(&self, registration: &MemberRegistration) -> Result<()> {
        let key = remote_key(registration)?;
        self.contents.write().remote.insert(key, registration.clone());
        Ok(())
    }

    async fn retrieve_remote_registration(
        &self,
        metadata_collection_id: &str,
    ) -> Result<Option<MemberRegistration>> {
        Ok(self.contents.read().remote.get(metadata_collection_id).cloned())
    }

    async fn retrieve_remote_registrations(&self) -> Result<Vec<MemberRegistration>> {
        Ok(self.contents.read().remote.values().cloned().collect())
    }

    async fn remove_remote_registration(&self, metadata_collection_id: &str) -> Result<bool> {
        Ok(self
            .contents
            .write()
            .remote
            .remove(metadata_collection_id)
            .is_some())
    }
}

/// A registry store persisted as one JSON file.
///
/// Every change rewrites the file through a temporary file and a rename, so a
/// crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileRegistryStore {
    path: PathBuf,
    contents: Mutex<RegistryContents>,
}

impl FileRegistryStore {
    /// Opens the store at `path`, loading existing contents if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryContents::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), peers = contents.remote.len(), "opened registry store");

        Ok(Self {
            path,
            contents: Mutex::new(contents),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, contents: &RegistryContents) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(contents)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Applies `change` and persists the result. The in-memory copy is only
    /// replaced once the file write succeeded.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryContents) + Send,
    {
        let mut contents = self.contents.lock().await;
        let mut next = contents.clone();
        change(&mut next);
        self.persist(&next).await?;
        *contents = next;
        Ok(())
    }
}

#[async_trait]
impl CohortRegistryStore for FileRegistryStore {
    async fn save_local_registration(&self, registration: &MemberRegistration) -> Result<()> {
        let registration = registration.clone();
        self.update(move |c| c.local = Some(registration)).await
    }

    async fn retrieve_local_registration(&self) -> Result<Option<MemberRegistration>> {
        Ok(self.contents.lock().await.local.clone())
    }

    async fn remove_local_registration(&self) -> Result<()> {
        self.update(|c| c.local = None).await
    }

    async fn save_remote_registration(&self, registration: &MemberRegistration) -> Result<()> {
        let key = remote_key(registration)?;
        let registration = registration.clone();
        self.update(move |c| {
            c.remote.insert(key, registration);
        })
        .await
    }

    async fn retrieve_remote_registration(
        &self,
        metadata_collection_id: &str,
    ) -> Result<Option<MemberRegistration>> {
        Ok(self
            .contents
            .lock()
            .await
            .remote
            .get(metadata_collection_id)
            .cloned())
    }

    async fn retrieve_remote_registrations(&self) -> Result<Vec<MemberRegistration>> {
        Ok(self.contents.lock().await.remote.values().cloned().collect())
    }

    async fn remove_remote_registration(&self, metadata_collection_id: &str) -> Result<bool> {
        if !self
            .contents
            .lock()
            .await
            .remote
            .contains_key(metadata_collection_id)
        {
            return Ok(false);
        }
        let key = metadata_collection_id.to_string();
        self.update(move |c| {
            c.remote.remove(&key);
        })
        .await?;
        Ok(true)
    }
}
