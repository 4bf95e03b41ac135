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

//! # Proxy entry points
//!
//! [`Protocol`] is what a transport layer calls into: it applies the filter, consults storage,
//! and stashes package versions on first request.

use std::{future::Future, time::Duration};

use crate::{
    errors::{Kind, Op, shared},
    fetch::{AnyLister, FetchError},
    filter::{Disposition, Filter},
    package::{Artifacts, PackagePath, VersionInfo, version},
    stash::{AnyStasher, StashError},
    storage::{AnyStorage, StorageError},
};

/// Entry points of the proxy.
#[derive(Clone, Debug)]
pub struct Protocol {
    filter: Filter,
    storage: AnyStorage,
    lister: AnyLister,
    stasher: AnyStasher,
    private: Option<AnyStasher>,
    timeout: Duration,
}

impl Protocol {
    /// Assemble the entry points.
    ///
    /// `private` stashes packages whose paths the filter marks as private. Without it, such
    /// packages are refused.
    pub fn new(
        filter: Filter,
        storage: AnyStorage,
        lister: AnyLister,
        stasher: AnyStasher,
        private: Option<AnyStasher>,
    ) -> Self {
        Self {
            filter,
            storage,
            lister,
            stasher,
            private,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Time storage operations may take unless configured otherwise.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Bound every storage operation by `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Run a storage operation, failing it once the timeout passes.
    async fn bounded<T>(
        &self,
        op: Op,
        operation: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StashError> {
        let result = match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(elapsed) => Err(StorageError::from(shared(elapsed))),
        };
        result.map_err(|source| StashError::Storage { op, source })
    }

    /// Storage this protocol serves from.
    pub fn storage(&self) -> &AnyStorage {
        &self.storage
    }

    /// Pick the stasher responsible for a package path.
    fn route(&self, path: &PackagePath) -> Result<(Disposition, &AnyStasher), StashError> {
        match self.filter.rule(path) {
            Disposition::Exclude => Err(StashError::Excluded(path.clone())),
            Disposition::Include => Ok((Disposition::Include, &self.stasher)),
            Disposition::Private => match &self.private {
                Some(private) => Ok((Disposition::Private, private)),
                None => Err(StashError::Fetch {
                    op: Op::Fetch,
                    source: FetchError::Unauthorized {
                        host: path.host().into(),
                    },
                }),
            },
        }
    }

    /// List versions of a package, stored or available upstream.
    ///
    /// Upstream failures degrade to the stored versions. Private packages are only listed from
    /// storage.
    pub async fn list(&self, path: &PackagePath) -> Result<Vec<String>, StashError> {
        let (disposition, _) = self.route(path)?;

        let mut versions = self.bounded(Op::List, self.storage.list(path)).await?;

        if disposition == Disposition::Include {
            match self.lister.list(path).await {
                Ok(upstream) => versions.extend(upstream),
                Err(error) if error.kind() == Kind::NotFound => {}
                Err(error) => tracing::warn!("listing {path} upstream failed: {error}"),
            }
        }

        versions.sort_by(|left, right| version::compare(left, right));
        versions.dedup();
        Ok(versions)
    }

    /// Resolve the latest version of a package.
    ///
    /// When upstream cannot be reached, the highest stored canonical version is reported.
    pub async fn latest(&self, path: &PackagePath) -> Result<VersionInfo, StashError> {
        let (disposition, _) = self.route(path)?;

        let upstream = match disposition {
            Disposition::Include => match self.lister.latest(path).await {
                Ok(info) => return Ok(info),
                Err(error) => error,
            },
            _ => FetchError::not_found(path, "latest", "private packages are not listed upstream"),
        };

        let stored = self.bounded(Op::List, self.storage.list(path)).await?;

        // releases are preferred over pseudo-versions
        let (pseudo, releases): (Vec<_>, Vec<_>) = stored
            .into_iter()
            .filter(|version| version::is_canonical(version))
            .partition(|version| version::is_pseudo(version));
        let highest = |versions: Vec<String>| {
            versions
                .into_iter()
                .max_by(|left, right| version::compare(left, right))
        };

        match highest(releases).or_else(|| highest(pseudo)) {
            Some(version) => {
                tracing::warn!("resolving latest {path} from storage: {upstream}");
                Ok(VersionInfo {
                    version,
                    time: None,
                })
            }
            None => Err(StashError::Fetch {
                op: Op::UpstreamLatest,
                source: upstream,
            }),
        }
    }

    /// Make sure a package version is stored, and return its artifacts.
    pub async fn materialize(
        &self,
        path: &PackagePath,
        version: &str,
    ) -> Result<(String, Artifacts), StashError> {
        let (_, stasher) = self.route(path)?;
        let stored = stasher.stash(path, version).await?;

        let artifacts = self.bounded(Op::Get, self.storage.get(path, &stored)).await?;

        Ok((stored, artifacts))
    }

    /// Determine if a package version is stored and may be served.
    ///
    /// A check that does not finish in time counts as not stored.
    pub async fn exists(&self, path: &PackagePath, version: &str) -> bool {
        if !self.filter.should_process(path) {
            return false;
        }

        match tokio::time::timeout(self.timeout, self.storage.exists(path, version)).await {
            Ok(exists) => exists,
            Err(_) => {
                tracing::warn!("{} of {path}@{version} timed out", Op::Exists);
                false
            }
        }
    }
}
