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

//! # Mutual exclusion per package version
//!
//! A [`Lock`] serializes work on one package version. [`Local`] only coordinates tasks within
//! one process, [`Redis`] coordinates any number of processes sharing a Redis instance.

use std::{fmt, sync::Arc};

use tokio::time::Instant;

use crate::{
    errors::{Kind, SharedError},
    package::PackagePath,
};

mod local;
#[cfg(feature = "lock-redis")]
mod redis;

pub use local::Local;
#[cfg(feature = "lock-redis")]
pub use self::redis::Redis;

/// Shared handle to any lock implementation.
pub type AnyLock = Arc<dyn Lock>;

/// Error acquiring or releasing a lock.
#[derive(thiserror::Error, Debug, Clone)]
pub enum LockError {
    /// Deadline passed before the lock could be acquired.
    #[error("timed out waiting for the lock on {0}")]
    Timeout(LockKey),

    /// Lock backend could not be reached.
    #[error("lock backend unavailable")]
    Unavailable(#[source] SharedError),
}

impl LockError {
    /// Classification of this error.
    pub fn kind(&self) -> Kind {
        Kind::Unexpected
    }
}

/// Identifies the package version a lock protects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    path: PackagePath,
    version: String,
}

impl LockKey {
    /// Create a key for a package version.
    pub fn new(path: &PackagePath, version: &str) -> Self {
        Self {
            path: path.clone(),
            version: version.into(),
        }
    }

    /// Package path.
    pub fn path(&self) -> &PackagePath {
        &self.path
    }

    /// Version.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

/// Mutual exclusion keyed by package version.
#[async_trait::async_trait]
pub trait Lock: Send + Sync + fmt::Debug {
    /// Acquire the lock for `key`, waiting at most until `deadline`.
    async fn acquire(&self, key: &LockKey, deadline: Instant) -> Result<LockHandle, LockError>;
}

/// Backend specific part of a held lock.
///
/// Dropping a lease without releasing it must not leave the lock held forever.
#[async_trait::async_trait]
pub trait Lease: Send + fmt::Debug {
    /// Give up the lock.
    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// A held lock.
///
/// Call [`LockHandle::release`] when done. A handle that is dropped instead still gives up the
/// lock, although a remote backend may only notice once the lease expires.
#[derive(Debug)]
pub struct LockHandle {
    key: LockKey,
    lease: Option<Box<dyn Lease>>,
}

impl LockHandle {
    /// Wrap a backend lease.
    pub fn new(key: LockKey, lease: Box<dyn Lease>) -> Self {
        Self {
            key,
            lease: Some(lease),
        }
    }

    /// Key this lock protects.
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Give up the lock.
    pub async fn release(mut self) -> Result<(), LockError> {
        match self.lease.take() {
            Some(lease) => lease.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.lease.is_some() {
            tracing::debug!("lock on {} dropped without release", self.key);
        }
    }
}
