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

//! # Upstream retrieval
//!
//! A [`Fetcher`] retrieves the artifacts of one package version from upstream and hands them
//! out as a [`Staged`] handle. Depending on the strategy, the artifacts are staged in a scratch
//! workspace on disk ([`Tool`], [`Private`]) or held in memory ([`Mirror`]).
//!
//! A [`Lister`] answers the upstream side of version listing.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;

use crate::{
    errors::{Kind, Op, SharedError, shared},
    package::{
        Artifacts, PackagePath, Revision, VersionInfo,
        version::{self, VersionError},
    },
};

mod mirror;
mod private;
mod tool;

pub use mirror::Mirror;
pub use private::{HostCredential, Private};
pub use tool::{Tool, ToolConfig};

/// Shared handle to any fetcher.
pub type AnyFetcher = Arc<dyn Fetcher>;

/// Shared handle to any lister.
pub type AnyLister = Arc<dyn Lister>;

/// Error retrieving a package version from upstream.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    /// Package path or version does not exist upstream.
    #[error("{path}@{version} not found upstream: {reason}")]
    NotFound {
        /// Package path.
        path: PackagePath,
        /// Requested version.
        version: String,
        /// Upstream explanation.
        reason: String,
    },

    /// Upstream quota exhausted.
    #[error("upstream rate limit exceeded: {0}")]
    RateLimited(String),

    /// Malformed request.
    #[error("invalid version")]
    BadRequest(#[from] VersionError),

    /// Package path is not covered by any credential binding.
    #[error("no credential is bound for host {host}")]
    Unauthorized {
        /// Host of the requested path.
        host: String,
    },

    /// Transport, tool or filesystem failure.
    #[error("{op} failed")]
    Unexpected {
        /// Failing operation.
        op: Op,
        /// Underlying error.
        #[source]
        source: SharedError,
    },
}

impl FetchError {
    pub(crate) fn not_found(path: &PackagePath, version: &str, reason: impl fmt::Display) -> Self {
        Self::NotFound {
            path: path.clone(),
            version: version.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unexpected<E: std::error::Error + Send + Sync + 'static>(op: Op, error: E) -> Self {
        Self::Unexpected {
            op,
            source: shared(error),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> Kind {
        match self {
            Self::NotFound { .. } => Kind::NotFound,
            Self::RateLimited(_) => Kind::RateLimited,
            Self::BadRequest(_) | Self::Unauthorized { .. } => Kind::BadRequest,
            Self::Unexpected { .. } => Kind::Unexpected,
        }
    }
}

/// Retrieves package versions from upstream.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync + fmt::Debug {
    /// Retrieve a package version.
    ///
    /// Versions which are not canonical are resolved first; [`Staged::version`] reports the
    /// version the artifacts belong to.
    async fn fetch(&self, path: &PackagePath, version: &str) -> Result<Staged, FetchError>;

    /// Resolve a version query to the canonical version it names.
    ///
    /// Canonical versions resolve to themselves without contacting upstream.
    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, FetchError>;
}

/// Lists package versions known upstream.
#[async_trait::async_trait]
pub trait Lister: Send + Sync + fmt::Debug {
    /// List all canonical versions of a package.
    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, FetchError>;

    /// Resolve the latest version of a package.
    async fn latest(&self, path: &PackagePath) -> Result<VersionInfo, FetchError>;
}

/// Upstream resolved a query to a version that cannot be stored.
#[derive(thiserror::Error, Debug)]
#[error("{query} resolved to unusable version {resolved:?}")]
struct Unresolvable {
    query: String,
    resolved: String,
}

/// Check the version upstream resolved `query` to.
///
/// The result must be canonical and usable as a storage key. Pseudo-versions must be well formed
/// and agree with the reported commit time.
pub(crate) fn check_resolved(
    path: &PackagePath,
    query: &str,
    info: VersionInfo,
) -> Result<String, FetchError> {
    let unresolvable = || {
        FetchError::unexpected(
            Op::Resolve,
            Unresolvable {
                query: query.into(),
                resolved: info.version.clone(),
            },
        )
    };

    if version::validate(&info.version).is_err() || !version::is_canonical(&info.version) {
        return Err(unresolvable());
    }

    match Revision::from_pseudo_version(&info.version) {
        Some(revision) if info.time.is_some_and(|time| time != revision.time) => {
            return Err(unresolvable());
        }
        Some(revision) => tracing::debug!(
            "resolved {path}@{query} to {} (revision {})",
            info.version,
            revision.id
        ),
        None => tracing::debug!("resolved {path}@{query} to {}", info.version),
    }

    Ok(info.version)
}

/// Scratch directory for one fetch attempt.
///
/// The directory is removed when [`Workspace::remove`] is called or the workspace is dropped.
/// The toolchain marks its module cache read-only, so everything is made writable first.
#[derive(Debug)]
pub(crate) struct Workspace {
    dir: Option<tempfile::TempDir>,
}

impl Workspace {
    const PREFIX: &'static str = "modstash-";

    pub(crate) fn new() -> Result<Self, FetchError> {
        let dir = tempfile::Builder::new()
            .prefix(Self::PREFIX)
            .tempdir()
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))?;
        Ok(Self { dir: Some(dir) })
    }

    /// Root of the workspace.
    pub(crate) fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(|dir| dir.path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Home directory handed to child processes.
    pub(crate) fn home(&self) -> PathBuf {
        self.path().join("home")
    }

    /// Determine if the workspace was removed already.
    pub(crate) fn is_removed(&self) -> bool {
        self.dir.is_none()
    }

    /// Remove the workspace and everything in it.
    pub(crate) fn remove(&mut self) -> std::io::Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        make_writable(dir.path());
        dir.close()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(error) = self.remove() {
            tracing::warn!("failed to remove workspace: {error}");
        }
    }
}

fn make_writable(root: &Path) {
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        // permissions follow links, which may point outside the workspace.
        if entry.path_is_symlink() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut permissions = metadata.permissions();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            permissions.set_mode(permissions.mode() | 0o700);
        }
        #[cfg(not(unix))]
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);

        if let Err(error) = std::fs::set_permissions(entry.path(), permissions) {
            tracing::debug!("failed to make {} writable: {error}", entry.path().display());
        }
    }
}

/// Location of staged artifacts.
#[derive(Debug)]
enum Contents {
    /// Files inside a workspace owned by the handle.
    Disk {
        workspace: Workspace,
        info: PathBuf,
        manifest: PathBuf,
        archive: PathBuf,
    },
    /// Artifacts held in memory.
    Memory(Artifacts),
}

/// Handle to the artifacts of one fetched package version.
///
/// The handle owns whatever scratch space the fetch used. [`Staged::clear`] releases it, and
/// dropping the handle does so as well, so no exit path leaks a workspace.
#[derive(Debug)]
pub struct Staged {
    path: PackagePath,
    version: String,
    contents: Contents,
}

/// Error reading staged artifacts that were cleared already.
#[derive(thiserror::Error, Debug)]
#[error("staged artifacts of {0} were cleared")]
struct Cleared(String);

impl Staged {
    /// Artifacts staged on disk, inside `workspace`.
    pub(crate) fn disk(
        path: &PackagePath,
        version: &str,
        workspace: Workspace,
        info: PathBuf,
        manifest: PathBuf,
        archive: PathBuf,
    ) -> Self {
        Self {
            path: path.clone(),
            version: version.into(),
            contents: Contents::Disk {
                workspace,
                info,
                manifest,
                archive,
            },
        }
    }

    /// Artifacts held in memory.
    pub fn memory(path: &PackagePath, version: &str, artifacts: Artifacts) -> Self {
        Self {
            path: path.clone(),
            version: version.into(),
            contents: Contents::Memory(artifacts),
        }
    }

    /// Package path the artifacts belong to.
    pub fn path(&self) -> &PackagePath {
        &self.path
    }

    /// Resolved, canonical version the artifacts belong to.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Read the staged artifacts.
    pub async fn read(&self) -> Result<Artifacts, FetchError> {
        match &self.contents {
            Contents::Memory(artifacts) => Ok(artifacts.clone()),
            Contents::Disk { workspace, .. } if workspace.is_removed() => Err(
                FetchError::unexpected(Op::Read, Cleared(format!("{}@{}", self.path, self.version))),
            ),
            Contents::Disk {
                info,
                manifest,
                archive,
                ..
            } => {
                let read = |file: &PathBuf| {
                    let file = file.clone();
                    async move {
                        tokio::fs::read(&file)
                            .await
                            .map(Bytes::from)
                            .map_err(|error| FetchError::unexpected(Op::Read, error))
                    }
                };

                let (info, manifest, archive) =
                    tokio::try_join!(read(info), read(manifest), read(archive))?;

                Ok(Artifacts {
                    info,
                    manifest,
                    archive,
                })
            }
        }
    }

    /// Release any scratch space held by this handle.
    ///
    /// Calling this more than once is harmless.
    pub fn clear(&mut self) -> Result<(), FetchError> {
        match &mut self.contents {
            Contents::Disk { workspace, .. } => workspace
                .remove()
                .map_err(|error| FetchError::unexpected(Op::Fetch, error)),
            Contents::Memory(_) => Ok(()),
        }
    }
}
