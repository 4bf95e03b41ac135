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

//! # Storage traits and implementations
//!
//! This module contains the [`Storage`] trait, which is used to persist package versions in
//! arbitrary places. Depending on the enabled features, this contains implementations and
//! layers that can be selected at startup.
//!
//! Every implementation upholds the same contract: a package version is stored as a complete
//! [`Artifacts`] triple or not at all, and once stored it is never overwritten.

use std::{fmt, sync::Arc};

use tokio::io::AsyncRead;

pub use crate::errors::SharedError;
use crate::{
    errors::Kind,
    package::{
        Artifacts, PackagePath,
        version::{self, VersionError},
    },
};

#[cfg(feature = "storage-cache")]
mod cache;
mod filesystem;
mod memory;
#[cfg(feature = "storage-s3")]
mod s3;

#[cfg(feature = "storage-cache")]
pub use cache::{Cache, CacheConfig};
pub use filesystem::Filesystem;
pub use memory::Memory;
#[cfg(feature = "storage-s3")]
pub use s3::S3;

/// Error interacting with storage.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StorageError {
    /// Package version is not stored.
    #[error("{path}@{version} is missing")]
    Missing {
        /// Package path.
        path: PackagePath,
        /// Version.
        version: String,
    },

    /// Package version is already stored.
    #[error("{path}@{version} already exists")]
    AlreadyExists {
        /// Package path.
        path: PackagePath,
        /// Version.
        version: String,
    },

    /// Operation is not supported by this storage.
    #[error("operation not supported by this storage")]
    NotImplemented,

    /// Version string cannot be used as a storage key.
    #[error("invalid version")]
    BadRequest(#[from] VersionError),

    /// Any other failure of the underlying medium.
    #[error(transparent)]
    Other(#[from] SharedError),
}

impl StorageError {
    pub(crate) fn missing(path: &PackagePath, version: &str) -> Self {
        Self::Missing {
            path: path.clone(),
            version: version.into(),
        }
    }

    pub(crate) fn already_exists(path: &PackagePath, version: &str) -> Self {
        Self::AlreadyExists {
            path: path.clone(),
            version: version.into(),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> Kind {
        match self {
            Self::Missing { .. } => Kind::NotFound,
            Self::AlreadyExists { .. } => Kind::AlreadyExists,
            Self::NotImplemented => Kind::NotImplemented,
            Self::BadRequest(_) => Kind::BadRequest,
            Self::Other(_) => Kind::Unexpected,
        }
    }
}

/// Shared handle to any storage implementation.
pub type AnyStorage = Arc<dyn Storage>;

/// One page of a storage catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogPage {
    /// Stored package versions, in storage order.
    pub entries: Vec<(PackagePath, String)>,
    /// Token to pass to retrieve the next page, if there is one.
    pub next: Option<String>,
}

/// Storage for package versions.
///
/// Package versions are immutable once written, which allows layering simple caches on top.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Determine if a complete package version is stored.
    ///
    /// Never fails: any uncertainty is reported as `false`.
    async fn exists(&self, path: &PackagePath, version: &str) -> bool;

    /// Get a stored package version.
    async fn get(&self, path: &PackagePath, version: &str) -> Result<Artifacts, StorageError>;

    /// Store a package version.
    ///
    /// This either stores all three parts or nothing. Storing a version a second time fails with
    /// [`StorageError::AlreadyExists`] and leaves the stored copy untouched.
    async fn save(
        &self,
        path: &PackagePath,
        version: &str,
        manifest: &[u8],
        archive: &mut (dyn AsyncRead + Send + Unpin),
        info: &[u8],
    ) -> Result<(), StorageError>;

    /// List stored versions of a package, in no particular order.
    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, StorageError>;

    /// Remove a stored package version.
    async fn delete(&self, path: &PackagePath, version: &str) -> Result<(), StorageError>;

    /// Enumerate stored package versions, one page at a time.
    async fn catalog(
        &self,
        _token: Option<&str>,
        _page_size: usize,
    ) -> Result<CatalogPage, StorageError> {
        Err(StorageError::NotImplemented)
    }
}

/// Validate a version before using it as part of a storage key.
pub(crate) fn check_version(version: &str) -> Result<(), StorageError> {
    version::validate(version).map_err(StorageError::BadRequest)
}

/// Catalog token for an entry, which is the entry itself.
fn catalog_token(path: &PackagePath, version: &str) -> String {
    format!("{path}@{version}")
}

/// Parse a catalog token.
///
/// Package paths never contain `@`, so the first one separates path and version.
fn parse_catalog_token(token: &str) -> Result<(PackagePath, String), StorageError> {
    let invalid = || StorageError::BadRequest(VersionError::Reserved(token.into()));
    let (path, version) = token.split_once('@').ok_or_else(invalid)?;
    let path = PackagePath::new(path).map_err(|_| invalid())?;
    Ok((path, version.into()))
}

/// Paginate a sorted list of catalog entries.
///
/// The token of a page is the last entry it contains; the next page starts after it.
pub(crate) fn paginate(
    entries: Vec<(PackagePath, String)>,
    token: Option<&str>,
    page_size: usize,
) -> Result<CatalogPage, StorageError> {
    let start = match token {
        Some(token) => {
            let after = parse_catalog_token(token)?;
            entries.partition_point(|entry| *entry <= after)
        }
        None => 0,
    };

    let page_size = page_size.max(1);
    let end = (start + page_size).min(entries.len());
    let page: Vec<_> = entries[start..end].to_vec();
    let next = match page.last() {
        Some((path, version)) if end < entries.len() => Some(catalog_token(path, version)),
        _ => None,
    };

    Ok(CatalogPage {
        entries: page,
        next,
    })
}
