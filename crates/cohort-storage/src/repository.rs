//! Type definition and instance stores of the local repository.

use crate::Result;
use async_trait::async_trait;
use cohort_types::{Instance, TypeDef};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Type definitions currently usable in the local repository.
#[async_trait]
pub trait TypeDefStore: Send + Sync {
    /// Gets a type by guid.
    async fn get(&self, guid: &str) -> Result<Option<TypeDef>>;

    /// Gets a type by name.
    async fn get_by_name(&self, name: &str) -> Result<Option<TypeDef>>;

    /// Inserts or replaces a type, keyed by guid.
    async fn put(&self, typedef: &TypeDef) -> Result<()>;

    /// Deletes a type. Returns true if it existed.
    async fn delete(&self, guid: &str) -> Result<bool>;

    /// Lists every type.
    async fn list(&self) -> Result<Vec<TypeDef>>;
}

/// Entities and relationships held by the local repository, keyed by guid.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Gets an instance.
    async fn get(&self, guid: &str) -> Result<Option<Instance>>;

    /// Inserts or replaces an instance.
    async fn put(&self, instance: &Instance) -> Result<()>;

    /// Deletes an instance, returning it if it existed.
    async fn delete(&self, guid: &str) -> Result<Option<Instance>>;

    /// Lists instances homed in `metadata_collection_id`.
    async fn list_by_home(&self, metadata_collection_id: &str) -> Result<Vec<Instance>>;

    /// Returns the number of instances.
    async fn count(&self) -> Result<usize>;
}

/// An in-memory type definition store.
#[derive(Debug, Default)]
pub struct MemoryTypeDefStore {
    types: RwLock<HashMap<String, TypeDef>>,
}

impl MemoryTypeDefStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TypeDefStore for MemoryTypeDefStore {
    async fn get(&self, guid: &str) -> Result<Option<TypeDef>> {
        Ok(self.types.read().get(guid).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<TypeDef>> {
        Ok(self.types.read().values().find(|t| t.name == name).cloned())
    }

    async fn put(&self, typedef: &TypeDef) -> Result<()> {
        self.types
            .write()
            .insert(typedef.guid.clone(), typedef.clone());
        Ok(())
    }

    async fn delete(&self, guid: &str) -> Result<bool> {
        Ok(self.types.write().remove(guid).is_some())
    }

    async fn list(&self) -> Result<Vec<TypeDef>> {
        Ok(self.types.read().values().cloned().collect())
    }
}

/// An in-memory instance store.
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<String, Instance>>,
}

impl MemoryInstanceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get(&self, guid: &str) -> Result<Option<Instance>> {
        Ok(self.instances.read().get(guid).cloned())
    }

    async fn put(&self, instance: &Instance) -> Result<()> {
        self.instances
            .write()
            .insert(instance.guid.clone(), instance.clone());
        Ok(())
    }

    async fn delete(&self, guid: &str) -> Result<Option<Instance>> {
        Ok(self.instances.write().remove(guid))
    }

    async fn list_by_home(&self, metadata_collection_id: &str) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.metadata_collection_id == metadata_collection_id)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.instances.read().len())
    }
}
