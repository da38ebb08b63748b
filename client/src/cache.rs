use ember_types::Address;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Async key→value cache with namespaced tables.
///
/// A consumed collaborator: no transactional guarantees, used only to
/// memoize one-time derived lookups across restarts. Losing it entirely is
/// a slowdown, never a correctness problem.
pub trait Cache: Send + Sync + 'static {
    fn get(
        &self,
        table: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, CacheError>> + Send;

    fn set(
        &self,
        table: &str,
        key: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn delete(&self, table: &str, key: &str)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    fn keys(&self, table: &str) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;

    fn tables(&self) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;
}

/// In-memory cache: the default when no persistent backend is wired in.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Cache for MemoryCache {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .lock()
            .get(table)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn set(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.lock()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), CacheError> {
        if let Some(entries) = self.lock().get_mut(table) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, table: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .lock()
            .get(table)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn tables(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.lock().keys().cloned().collect())
    }
}

const META_TABLE: &str = "__meta";
const VERSION_KEY: &str = "store_version";

/// Versioned wrapper over a cache backend.
///
/// Schema changes are handled by bumping the store version: a mismatch on
/// open discards every prior entry. There is no migration path.
pub struct Versioned<C: Cache> {
    inner: C,
}

impl<C: Cache> Versioned<C> {
    pub async fn open(inner: C, version: u32) -> Result<Self, CacheError> {
        let stored: Option<u32> = match inner.get(META_TABLE, VERSION_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).ok(),
            None => None,
        };
        if stored != Some(version) {
            if let Some(stored) = stored {
                info!(stored, version, "cache version changed; discarding entries");
            }
            for table in inner.tables().await? {
                for key in inner.keys(&table).await? {
                    inner.delete(&table, &key).await?;
                }
            }
            let encoded = serde_json::to_vec(&version)
                .map_err(|err| CacheError(err.to_string()))?;
            inner.set(META_TABLE, VERSION_KEY, encoded).await?;
        }
        Ok(Self { inner })
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        match self.inner.get(table, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| CacheError(err.to_string())),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        table: &str,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(value).map_err(|err| CacheError(err.to_string()))?;
        self.inner.set(table, key, encoded).await
    }

    pub async fn delete(&self, table: &str, key: &str) -> Result<(), CacheError> {
        self.inner.delete(table, key).await
    }

    pub async fn keys(&self, table: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys(table).await
    }

    /// Fetch-through memoization for one-time derived lookups.
    pub async fn memoize<T, F, Fut>(
        &self,
        table: &str,
        key: &str,
        fetch: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        if let Some(value) = self.get(table, key).await? {
            return Ok(value);
        }
        let value = fetch().await?;
        self.set(table, key, &value).await?;
        Ok(value)
    }
}

/// Composite domain key, e.g. `<player>-<contract>`.
pub fn scoped_key(player: &Address, contract: &Address) -> String {
    format!("{player}-{contract}")
}
