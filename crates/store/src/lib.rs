//! lazywatch store: the local read cache a watcher keeps for its collection.

#![forbid(unsafe_code)]

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kube::Resource;
use lazywatch_core::{ObjectKey, StoreError};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Derive the cache key of an object from its metadata.
pub fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey, StoreError> {
    let meta = obj.meta();
    let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(StoreError::MissingName)?;
    Ok(ObjectKey::new(meta.namespace.as_deref(), name))
}

/// Key-value store of the latest known version of each object.
pub trait Store<K>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;
    fn list(&self) -> Vec<K>;
    fn list_keys(&self) -> Vec<ObjectKey>;
    /// Insert or overwrite.
    fn add(&self, obj: K) -> Result<(), StoreError>;
    /// Overwrite (inserts when absent).
    fn update(&self, obj: K) -> Result<(), StoreError>;
    /// Remove by derived key; fails with [`StoreError::NotFound`] when absent.
    fn delete(&self, obj: &K) -> Result<(), StoreError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// In-memory store keyed by namespace/name.
pub struct MemStore<K> {
    items: RwLock<FxHashMap<ObjectKey, K>>,
}

impl<K> Default for MemStore<K> {
    fn default() -> Self { Self { items: RwLock::new(FxHashMap::default()) } }
}

impl<K> MemStore<K> {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, K>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ObjectKey, K>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, obj: K) -> Result<(), StoreError>
    where
        K: Resource,
    {
        let key = key_of(&obj)?;
        trace!(key = %key, "store put");
        self.write().insert(key, obj);
        Ok(())
    }
}

impl<K> Store<K> for MemStore<K>
where
    K: Resource + Clone + Send + Sync,
{
    fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        Ok(self.read().get(key).cloned())
    }

    fn list(&self) -> Vec<K> { self.read().values().cloned().collect() }

    fn list_keys(&self) -> Vec<ObjectKey> { self.read().keys().cloned().collect() }

    fn add(&self, obj: K) -> Result<(), StoreError> { self.put(obj) }

    fn update(&self, obj: K) -> Result<(), StoreError> { self.put(obj) }

    fn delete(&self, obj: &K) -> Result<(), StoreError> {
        let key = key_of(obj)?;
        match self.write().remove(&key) {
            Some(_) => {
                trace!(key = %key, "store delete");
                Ok(())
            }
            None => Err(StoreError::NotFound(key)),
        }
    }

    fn len(&self) -> usize { self.read().len() }
}
