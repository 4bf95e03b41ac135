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

//! # Populating storage
//!
//! A [`Stasher`] makes sure a package version ends up in storage. [`Fetching`] does the actual
//! work, [`SingleFlight`] wraps any stasher so that concurrent requests for the same version,
//! in this process or any other sharing the lock, only do that work once.

use std::{fmt, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    errors::{Kind, Op, SharedError, shared},
    fetch::{AnyFetcher, FetchError, Staged},
    lock::{AnyLock, LockError, LockKey},
    package::{
        PackagePath,
        version::{self, VersionError},
    },
    storage::{AnyStorage, StorageError},
};

/// Error stashing a package version.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
pub enum StashError {
    /// Package path is excluded by the filter.
    #[error("{0} is excluded")]
    Excluded(PackagePath),

    /// Retrieving from upstream failed.
    #[error("{op} failed")]
    Fetch {
        /// Failing operation.
        op: Op,
        /// Underlying error.
        #[source]
        source: FetchError,
    },

    /// Storage operation failed.
    #[error("{op} failed")]
    Storage {
        /// Failing operation.
        op: Op,
        /// Underlying error.
        #[source]
        source: StorageError,
    },

    /// Lock could not be acquired.
    #[error("failed to acquire lock")]
    Lock(#[from] LockError),

    /// Version string is malformed.
    #[error("invalid version")]
    BadRequest(#[from] VersionError),

    /// Stashing took longer than allowed.
    #[error("stashing {0} timed out")]
    Timeout(LockKey),

    /// Background task failed.
    #[error("stash task failed")]
    Task(#[source] SharedError),
}

impl StashError {
    /// Classification of this error.
    pub fn kind(&self) -> Kind {
        match self {
            Self::Excluded(_) => Kind::NotFound,
            Self::Fetch { source, .. } => source.kind(),
            Self::Storage { source, .. } => source.kind(),
            Self::Lock(error) => error.kind(),
            Self::BadRequest(_) => Kind::BadRequest,
            Self::Timeout(_) | Self::Task(_) => Kind::Unexpected,
        }
    }
}

/// Makes sure a package version is stored.
#[async_trait::async_trait]
pub trait Stasher: Send + Sync + fmt::Debug {
    /// Store a package version, returning the canonical version it was stored under.
    async fn stash(&self, path: &PackagePath, version: &str) -> Result<String, StashError>;

    /// Resolve a version query to the canonical version it would be stored under.
    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, StashError>;
}

/// Shared handle to any stasher.
pub type AnyStasher = Arc<dyn Stasher>;

/// Stasher fetching from upstream and saving to storage.
#[derive(Clone, Debug)]
pub struct Fetching {
    fetcher: AnyFetcher,
    storage: AnyStorage,
}

impl Fetching {
    /// Create a stasher from a fetcher and the storage to save into.
    pub fn new(fetcher: AnyFetcher, storage: AnyStorage) -> Self {
        Self { fetcher, storage }
    }

    async fn save(&self, staged: &Staged) -> Result<(), StashError> {
        let artifacts = staged
            .read()
            .await
            .map_err(|source| StashError::Fetch {
                op: Op::Read,
                source,
            })?;
        let mut archive = artifacts.archive_reader();

        let result = self
            .storage
            .save(
                staged.path(),
                staged.version(),
                &artifacts.manifest,
                &mut archive,
                &artifacts.info,
            )
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    "stored {}@{} ({} bytes)",
                    staged.path(),
                    staged.version(),
                    artifacts.len()
                );
                Ok(())
            }
            Err(StorageError::AlreadyExists { .. }) => {
                tracing::debug!("{}@{} was stored concurrently", staged.path(), staged.version());
                Ok(())
            }
            Err(source) => Err(StashError::Storage {
                op: Op::Save,
                source,
            }),
        }
    }
}

#[async_trait::async_trait]
impl Stasher for Fetching {
    async fn stash(&self, path: &PackagePath, version: &str) -> Result<String, StashError> {
        let mut staged = self
            .fetcher
            .fetch(path, version)
            .await
            .map_err(|source| StashError::Fetch {
                op: Op::Fetch,
                source,
            })?;

        let result = self.save(&staged).await;

        if let Err(error) = staged.clear() {
            tracing::warn!("failed to clear staged {path}@{version}: {error}");
        }

        result.map(|()| staged.version().to_string())
    }

    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, StashError> {
        self.fetcher
            .resolve(path, version)
            .await
            .map_err(|source| StashError::Fetch {
                op: Op::Resolve,
                source,
            })
    }
}

/// Stasher making sure only one stash per package version is in flight.
///
/// Version queries are resolved first, so everything below is keyed on the canonical version.
/// Requests for versions already in storage return right away. Everything else takes the lock
/// for the version, checks storage again, and only then runs the wrapped stasher. The work runs
/// in its own task: a caller that gives up only stops waiting, the work still completes and
/// releases the lock.
#[derive(Clone, Debug)]
pub struct SingleFlight {
    storage: AnyStorage,
    inner: AnyStasher,
    lock: AnyLock,
    timeout: Duration,
}

impl SingleFlight {
    /// Wrap a stasher.
    ///
    /// `timeout` bounds resolution, storage checks, the wait for the lock and the wrapped stash.
    pub fn new(storage: AnyStorage, inner: AnyStasher, lock: AnyLock, timeout: Duration) -> Self {
        Self {
            storage,
            inner,
            lock,
            timeout,
        }
    }
}

/// Determine if a version is stored, treating a stalled check as a miss.
async fn stored(
    storage: &AnyStorage,
    path: &PackagePath,
    version: &str,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, storage.exists(path, version)).await {
        Ok(exists) => exists,
        Err(_) => {
            tracing::warn!("{} of {path}@{version} timed out", Op::Exists);
            false
        }
    }
}

#[async_trait::async_trait]
impl Stasher for SingleFlight {
    async fn stash(&self, path: &PackagePath, version: &str) -> Result<String, StashError> {
        version::validate(version)?;

        let version = self.resolve(path, version).await?;

        if stored(&self.storage, path, &version, self.timeout).await {
            tracing::debug!("{path}@{version} already stored");
            return Ok(version);
        }

        let key = LockKey::new(path, &version);
        let handle = self
            .lock
            .acquire(&key, Instant::now() + self.timeout)
            .await?;

        let storage = self.storage.clone();
        let inner = self.inner.clone();
        let timeout = self.timeout;
        let path = path.clone();

        let task = tokio::spawn(async move {
            let result = if stored(&storage, &path, &version, timeout).await {
                tracing::debug!("{path}@{version} was stored while waiting for the lock");
                Ok(version.clone())
            } else {
                match tokio::time::timeout(timeout, inner.stash(&path, &version)).await {
                    Ok(result) => result,
                    Err(_) => Err(StashError::Timeout(handle.key().clone())),
                }
            };

            if let Err(error) = handle.release().await {
                tracing::warn!("failed to release lock on {path}@{version}: {error}");
            }

            result
        });

        task.await.map_err(|error| StashError::Task(shared(error)))?
    }

    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, StashError> {
        if version::is_canonical(version) {
            return Ok(version.to_string());
        }

        let resolved = tokio::time::timeout(self.timeout, self.inner.resolve(path, version))
            .await
            .map_err(|_| StashError::Timeout(LockKey::new(path, version)))??;
        tracing::debug!("resolved {path}@{version} to {resolved}");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_keep_their_kind() {
        let path = PackagePath::new("github.com/a/b").unwrap();
        let error = StashError::Fetch {
            op: Op::Fetch,
            source: FetchError::RateLimited("slow down".into()),
        };
        assert_eq!(error.kind(), Kind::RateLimited);

        let error = StashError::Storage {
            op: Op::Get,
            source: StorageError::missing(&path, "v1.0.0"),
        };
        assert_eq!(error.kind(), Kind::NotFound);
        assert_eq!(StashError::Excluded(path).kind(), Kind::NotFound);
    }
}
