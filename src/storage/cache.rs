// Copyright 2023 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Storage cache layer.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{Expiry, future::Cache as MokaCache};
use serde::Deserialize;
use tokio::io::AsyncRead;

use crate::{
    package::{Artifacts, PackagePath},
    storage::{CatalogPage, Storage, StorageError},
};

/// Cache key, the package version.
type Key = (PackagePath, String);

/// Cache entry for one package version lookup.
#[derive(Clone, Debug)]
enum Entry {
    /// Version is missing.
    Missing,
    /// Version exists.
    Data(Artifacts),
}

impl Entry {
    /// Determine the weight of this entry.
    fn weight(&self) -> usize {
        match self {
            Self::Missing => 1,
            Self::Data(artifacts) => artifacts.len().max(1),
        }
    }
}

/// Configuration for storage [`Cache`].
///
/// In general, you should use the [`CacheConfig::default()`] implementation to create a default
/// configuration. The value that you should consider tweaking is the `capacity`, which you should
/// set to however much memory you are willing to throw at the cache.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of cache, in bytes.
    ///
    /// The default is set to 64MB, since archives tend to be larger than their metadata.
    pub capacity: u64,

    /// Timeout for missing entries.
    ///
    /// Stored versions are immutable, so we can cache them forever. Negative lookups change as
    /// versions are stored, so they have a dedicated cache duration that should be set low.
    #[serde(with = "seconds")]
    pub timeout_missing: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
            timeout_missing: Duration::from_secs(10),
        }
    }
}

impl Expiry<Key, Entry> for CacheConfig {
    fn expire_after_create(&self, _key: &Key, value: &Entry, _created_at: Instant) -> Option<Duration> {
        match value {
            Entry::Missing => Some(self.timeout_missing),
            Entry::Data(_) => None,
        }
    }
}

/// Durations given as a number of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Storage caching layer.
///
/// This is a layer you can use to wrap an existing storage provider to add an in-memory cache.
/// This allows you to serve commonly requested package versions more efficiently. Saving or
/// deleting through the layer invalidates the affected entry.
///
/// # Examples
///
/// Wrapping an existing storage implementation in the caching layer:
///
/// ```rust
/// # use modstash::storage::{Filesystem, Cache, CacheConfig};
/// // underlying storage implementation
/// let storage = Filesystem::new("/path/to/storage");
///
/// // wrap in caching layer with a capacity of 100MB.
/// let storage = Cache::new(storage, CacheConfig {
///     capacity: 100 * 1024 * 1024,
///     ..Default::default()
/// });
/// ```
#[derive(Clone, Debug)]
pub struct Cache<S: Storage> {
    /// Underlying storage implementation
    storage: Arc<S>,
    /// Cache used for stored versions
    cache: MokaCache<Key, Entry>,
}

impl<S: Storage> Cache<S> {
    /// Create new caching layer on top of a storage.
    pub fn new(storage: S, config: CacheConfig) -> Self {
        // the weigher only supports u32 values, entries larger than 4GB weigh the maximum.
        let cache = MokaCache::builder()
            .weigher(|_key, value: &Entry| -> u32 { value.weight().try_into().unwrap_or(u32::MAX) })
            .max_capacity(config.capacity)
            .expire_after(config)
            .build();
        let storage = Arc::new(storage);

        Self { storage, cache }
    }

    /// Get a reference to the underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Clear the cache.
    ///
    /// This will invalidate all cache entries.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    fn key(path: &PackagePath, version: &str) -> Key {
        (path.clone(), version.to_string())
    }
}

#[async_trait::async_trait]
impl<S: Storage + 'static> Storage for Cache<S> {
    async fn exists(&self, path: &PackagePath, version: &str) -> bool {
        if let Some(Entry::Data(_)) = self.cache.get(&Self::key(path, version)).await {
            return true;
        }
        self.storage.exists(path, version).await
    }

    async fn get(&self, path: &PackagePath, version: &str) -> Result<Artifacts, StorageError> {
        let storage = self.storage.clone();
        let key = Self::key(path, version);

        // using try_get_with here ensures that concurrent requests for the same version only
        // make one lookup.
        let result = self
            .cache
            .try_get_with(key.clone(), async move {
                match storage.get(&key.0, &key.1).await {
                    Ok(artifacts) => Ok(Entry::Data(artifacts)),
                    Err(StorageError::Missing { .. }) => Ok(Entry::Missing),
                    Err(error) => Err(error),
                }
            })
            .await;

        match result {
            Ok(Entry::Data(artifacts)) => {
                tracing::debug!("cache hit for {path}@{version}");
                Ok(artifacts)
            }
            Ok(Entry::Missing) => Err(StorageError::missing(path, version)),
            Err(error) => Err((*error).clone()),
        }
    }

    async fn save(
        &self,
        path: &PackagePath,
        version: &str,
        manifest: &[u8],
        archive: &mut (dyn AsyncRead + Send + Unpin),
        info: &[u8],
    ) -> Result<(), StorageError> {
        let result = self
            .storage
            .save(path, version, manifest, archive, info)
            .await;
        self.cache.invalidate(&Self::key(path, version)).await;
        result
    }

    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, StorageError> {
        self.storage.list(path).await
    }

    async fn delete(&self, path: &PackagePath, version: &str) -> Result<(), StorageError> {
        let result = self.storage.delete(path, version).await;
        self.cache.invalidate(&Self::key(path, version)).await;
        result
    }

    async fn catalog(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<CatalogPage, StorageError> {
        self.storage.catalog(token, page_size).await
    }
}
