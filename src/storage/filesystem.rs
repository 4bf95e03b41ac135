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

use std::{
    fmt::Debug,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};
use walkdir::WalkDir;

use super::*;
use crate::errors::shared;

/// Name of the directory holding all versions of a package.
const VERSIONS_DIR: &str = "@v";

/// Prefix of staging directories created while saving.
const STAGING_PREFIX: &str = ".staging-";

/// Filesystem-backed storage for package versions.
///
/// Every version lives in its own directory, `<root>/<escaped path>/@v/<version>/`, holding
/// the three files `<version>.info`, `<version>.mod` and `<version>.zip`. Versions are written
/// into a staging directory first and then renamed into place, so a version directory is
/// always complete.
#[derive(Clone, Debug)]
pub struct Filesystem<P: AsRef<Path> = PathBuf> {
    path: P,
}

#[derive(thiserror::Error, Debug)]
#[error("error accessing {path:?}")]
pub struct FilesystemError {
    path: PathBuf,
    #[source]
    error: std::io::Error,
}

impl FilesystemError {
    fn new(path: &Path, error: std::io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            error,
        }
    }
}

impl<P: AsRef<Path>> Filesystem<P> {
    /// Create new Filesystem storage instance.
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Get the base path of this filesystem storage instance.
    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }

    /// Directory holding all versions of a package.
    fn package_path(&self, path: &PackagePath) -> PathBuf {
        self.path().join(path.escaped()).join(VERSIONS_DIR)
    }

    /// Directory holding a single version.
    pub fn version_path(&self, path: &PackagePath, version: &str) -> PathBuf {
        self.package_path(path).join(version)
    }

    /// Location of one part of a version, inside `directory`.
    fn part_path(directory: &Path, version: &str, extension: &str) -> PathBuf {
        directory.join(format!("{version}.{extension}"))
    }

    async fn write_part(path: &Path, data: &[u8]) -> Result<(), FilesystemError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|error| FilesystemError::new(path, error))?;
        file.write_all(data)
            .await
            .map_err(|error| FilesystemError::new(path, error))?;
        file.sync_all()
            .await
            .map_err(|error| FilesystemError::new(path, error))?;
        Ok(())
    }

    async fn write_archive(
        path: &Path,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), FilesystemError> {
        let mut file = File::create(path)
            .await
            .map_err(|error| FilesystemError::new(path, error))?;
        tokio::io::copy(archive, &mut file)
            .await
            .map_err(|error| FilesystemError::new(path, error))?;
        file.sync_all()
            .await
            .map_err(|error| FilesystemError::new(path, error))?;
        Ok(())
    }

    async fn do_save(
        &self,
        path: &PackagePath,
        version: &str,
        manifest: &[u8],
        archive: &mut (dyn AsyncRead + Send + Unpin),
        info: &[u8],
    ) -> Result<(), StorageError> {
        let target = self.version_path(path, version);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(StorageError::already_exists(path, version));
        }

        let parent = self.package_path(path);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|error| shared(FilesystemError::new(&parent, error)))?;

        // the staging directory is removed when dropped, unless it was renamed into place.
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.path())
            .map_err(|error| shared(FilesystemError::new(self.path(), error)))?;

        Self::write_part(
            &Self::part_path(staging.path(), version, Artifacts::MANIFEST_EXTENSION),
            manifest,
        )
        .await
        .map_err(shared)?;
        Self::write_archive(
            &Self::part_path(staging.path(), version, Artifacts::ARCHIVE_EXTENSION),
            archive,
        )
        .await
        .map_err(shared)?;
        Self::write_part(
            &Self::part_path(staging.path(), version, Artifacts::INFO_EXTENSION),
            info,
        )
        .await
        .map_err(shared)?;

        match tokio::fs::rename(staging.path(), &target).await {
            Ok(()) => Ok(()),
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty
                ) =>
            {
                Err(StorageError::already_exists(path, version))
            }
            Err(error) => Err(shared(FilesystemError::new(&target, error)).into()),
        }
    }

    async fn read_part(
        &self,
        path: &PackagePath,
        version: &str,
        extension: &str,
    ) -> Result<Bytes, StorageError> {
        let file = Self::part_path(&self.version_path(path, version), version, extension);
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(data.into()),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(StorageError::missing(path, version))
            }
            Err(error) => Err(shared(FilesystemError::new(&file, error)).into()),
        }
    }
}

/// Walk the storage tree and collect every stored version.
fn walk(root: &Path) -> Vec<(PackagePath, String)> {
    let mut entries = vec![];

    for entry in WalkDir::new(root).min_depth(4).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }

        // <root>/<escaped path>/@v/<version>/<version>.info
        let file = entry.path();
        let Some(version_dir) = file.parent() else {
            continue;
        };
        let Some(versions_dir) = version_dir.parent() else {
            continue;
        };
        let (Some(version), Some(marker)) = (
            version_dir.file_name().and_then(|name| name.to_str()),
            versions_dir.file_name().and_then(|name| name.to_str()),
        ) else {
            continue;
        };

        let expected = format!("{version}.{}", Artifacts::INFO_EXTENSION);
        if marker != VERSIONS_DIR || entry.file_name().to_str() != Some(expected.as_str()) {
            continue;
        }

        let Some(escaped) = versions_dir
            .parent()
            .and_then(|package| package.strip_prefix(root).ok())
            .and_then(|package| package.to_str())
        else {
            continue;
        };

        match PackagePath::unescape(escaped) {
            Ok(path) => entries.push((path, version.to_string())),
            Err(error) => tracing::warn!("skipping unexpected entry {escaped:?}: {error}"),
        }
    }

    entries.sort();
    entries
}

#[async_trait::async_trait]
impl<P: AsRef<Path> + Send + Sync + Debug> Storage for Filesystem<P> {
    async fn exists(&self, path: &PackagePath, version: &str) -> bool {
        if check_version(version).is_err() {
            return false;
        }

        let info = Self::part_path(
            &self.version_path(path, version),
            version,
            Artifacts::INFO_EXTENSION,
        );
        tokio::fs::try_exists(&info).await.unwrap_or(false)
    }

    async fn get(&self, path: &PackagePath, version: &str) -> Result<Artifacts, StorageError> {
        check_version(version)?;
        Ok(Artifacts {
            info: self
                .read_part(path, version, Artifacts::INFO_EXTENSION)
                .await?,
            manifest: self
                .read_part(path, version, Artifacts::MANIFEST_EXTENSION)
                .await?,
            archive: self
                .read_part(path, version, Artifacts::ARCHIVE_EXTENSION)
                .await?,
        })
    }

    async fn save(
        &self,
        path: &PackagePath,
        version: &str,
        manifest: &[u8],
        archive: &mut (dyn AsyncRead + Send + Unpin),
        info: &[u8],
    ) -> Result<(), StorageError> {
        check_version(version)?;
        self.do_save(path, version, manifest, archive, info).await
    }

    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, StorageError> {
        let directory = self.package_path(path);
        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(shared(FilesystemError::new(&directory, error)).into()),
        };

        let mut versions = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| shared(FilesystemError::new(&directory, error)))?
        {
            let Some(version) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if self.exists(path, &version).await {
                versions.push(version);
            }
        }

        Ok(versions)
    }

    async fn delete(&self, path: &PackagePath, version: &str) -> Result<(), StorageError> {
        check_version(version)?;
        let directory = self.version_path(path, version);

        // the version is moved out of place in one step, then removed at leisure.
        let trash = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.path())
            .map_err(|error| shared(FilesystemError::new(self.path(), error)))?;
        let removed = trash.path().join(version);

        match tokio::fs::rename(&directory, &removed).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StorageError::missing(path, version));
            }
            Err(error) => return Err(shared(FilesystemError::new(&directory, error)).into()),
        }

        let location = trash.path().to_path_buf();
        match tokio::task::spawn_blocking(move || trash.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!("failed to remove {}: {error}", location.display()),
            Err(error) => tracing::warn!("failed to remove {}: {error}", location.display()),
        }
        Ok(())
    }

    async fn catalog(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<CatalogPage, StorageError> {
        let root = self.path().to_path_buf();
        let entries = tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(shared)?;
        paginate(entries, token, page_size)
    }
}
