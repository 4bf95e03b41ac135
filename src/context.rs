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

use std::{path::Path, sync::Arc, time::Duration};

use miette::{Context as _, IntoDiagnostic};

#[cfg(feature = "storage-cache")]
use crate::storage::Cache;
#[cfg(feature = "storage-s3")]
use crate::storage::S3;
use crate::{
    config::{Config, FetcherConfig, LockConfig, StorageConfig},
    fetch::{AnyFetcher, AnyLister, Mirror, Private, Tool, ToolConfig},
    lock::{AnyLock, Local},
    protocol::Protocol,
    stash::{AnyStasher, Fetching, SingleFlight},
    storage::{AnyStorage, Filesystem, Memory, Storage},
};

/// Shared context of a running proxy.
///
/// Holds every component, wired together as configured.
#[derive(Debug)]
pub struct Context {
    protocol: Protocol,
    storage: AnyStorage,
}

impl Context {
    /// Entry points of the proxy.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Storage backend, including the cache layer if one is configured.
    pub fn storage(&self) -> &AnyStorage {
        &self.storage
    }

    /// Create a new context from a configuration.
    pub async fn create(config: &Config) -> miette::Result<Arc<Self>> {
        let timeout = config.timeout();
        let filter = config.filter.load().await?;
        let storage = storage(config).await?;
        let lock = lock(&config.lock).await?;

        let tool = match &config.fetcher {
            FetcherConfig::Tool(tool) => Tool::new(tool.clone()),
            FetcherConfig::Mirror { .. } => Tool::new(ToolConfig::default()),
        };

        let (fetcher, lister): (AnyFetcher, AnyLister) = match &config.fetcher {
            FetcherConfig::Tool(_) => {
                let tool = Arc::new(tool.clone());
                let fetcher: AnyFetcher = tool.clone();
                let lister: AnyLister = tool;
                (fetcher, lister)
            }
            FetcherConfig::Mirror { url } => {
                let mirror = Mirror::new(url.clone(), timeout)
                    .into_diagnostic()
                    .wrap_err("failed to create mirror client")?;
                let mirror = Arc::new(mirror);
                let fetcher: AnyFetcher = mirror.clone();
                let lister: AnyLister = mirror;
                (fetcher, lister)
            }
        };

        let single_flight = |fetcher: AnyFetcher| -> AnyStasher {
            let inner: AnyStasher = Arc::new(Fetching::new(fetcher, storage.clone()));
            Arc::new(SingleFlight::new(
                storage.clone(),
                inner,
                lock.clone(),
                timeout,
            ))
        };

        let stasher = single_flight(fetcher);
        let private = config.private.clone().map(|credential| {
            tracing::debug!("private packages are fetched from {}", credential.host);
            let fetcher: AnyFetcher = Arc::new(Private::new(&tool, credential));
            single_flight(fetcher)
        });

        let protocol = Protocol::new(filter, storage.clone(), lister, stasher, private)
            .with_timeout(timeout);
        Ok(Arc::new(Self { protocol, storage }))
    }

    /// Open a context from a configuration file.
    pub async fn open(path: &Path) -> miette::Result<Arc<Self>> {
        let config = Config::load(path)
            .await
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;
        Self::create(&config).await
    }
}

/// Wrap a storage backend in the configured cache layer.
fn layered<S: Storage + 'static>(storage: S, config: &Config) -> AnyStorage {
    #[cfg(feature = "storage-cache")]
    if let Some(cache) = config.cache {
        tracing::debug!("caching up to {} bytes of storage", cache.capacity);
        return Arc::new(Cache::new(storage, cache));
    }

    #[cfg(not(feature = "storage-cache"))]
    let _ = config;

    Arc::new(storage)
}

async fn storage(config: &Config) -> miette::Result<AnyStorage> {
    match &config.storage {
        StorageConfig::Memory => Ok(layered(Memory::new(), config)),
        StorageConfig::Filesystem { path } => {
            tokio::fs::create_dir_all(path)
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to create {}", path.display()))?;
            Ok(layered(Filesystem::new(path.clone()), config))
        }
        #[cfg(feature = "storage-s3")]
        StorageConfig::S3 { bucket, endpoint } => {
            let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let timeouts = aws_sdk_s3::config::timeout::TimeoutConfig::builder()
                .operation_timeout(config.timeout())
                .build();
            let mut builder =
                aws_sdk_s3::config::Builder::from(&shared).timeout_config(timeouts);
            if let Some(endpoint) = endpoint {
                builder = builder
                    .endpoint_url(endpoint.as_str())
                    .force_path_style(true);
            }
            let client = aws_sdk_s3::Client::from_conf(builder.build());
            Ok(layered(S3::new(client, bucket.clone()), config))
        }
        #[cfg(not(feature = "storage-s3"))]
        StorageConfig::S3 { .. } => Err(miette::miette!(
            "s3 storage requires the storage-s3 feature"
        )),
    }
}

async fn lock(config: &LockConfig) -> miette::Result<AnyLock> {
    match config {
        LockConfig::Local => Ok(Arc::new(Local::new())),
        #[cfg(feature = "lock-redis")]
        LockConfig::Redis { url, ttl } => {
            let redis = crate::lock::Redis::connect(url, Duration::from_secs(*ttl))
                .await
                .into_diagnostic()
                .wrap_err("failed to connect to the lock backend")?;
            Ok(Arc::new(redis))
        }
        #[cfg(not(feature = "lock-redis"))]
        LockConfig::Redis { .. } => Err(miette::miette!(
            "redis locks require the lock-redis feature"
        )),
    }
}
