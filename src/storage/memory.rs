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

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::RwLock,
};

use super::*;
use crate::errors::shared;

/// In-memory storage for package versions.
///
/// Every instance is its own store; nothing is shared between instances. Mostly useful for
/// tests and short-lived processes.
#[derive(Debug, Default)]
pub struct Memory {
    packages: RwLock<HashMap<PackagePath, BTreeMap<String, Artifacts>>>,
}

impl Memory {
    /// Create new, empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored package versions.
    pub async fn len(&self) -> usize {
        self.packages.read().await.values().map(BTreeMap::len).sum()
    }

    /// Determine if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl Storage for Memory {
    async fn exists(&self, path: &PackagePath, version: &str) -> bool {
        self.packages
            .read()
            .await
            .get(path)
            .is_some_and(|versions| versions.contains_key(version))
    }

    async fn get(&self, path: &PackagePath, version: &str) -> Result<Artifacts, StorageError> {
        check_version(version)?;
        self.packages
            .read()
            .await
            .get(path)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| StorageError::missing(path, version))
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

        // drain the archive before taking the lock, a failing reader leaves nothing behind.
        let mut data = Vec::new();
        archive.read_to_end(&mut data).await.map_err(shared)?;

        let artifacts = Artifacts {
            info: Bytes::copy_from_slice(info),
            manifest: Bytes::copy_from_slice(manifest),
            archive: data.into(),
        };

        let mut packages = self.packages.write().await;
        let versions = packages.entry(path.clone()).or_default();
        if versions.contains_key(version) {
            return Err(StorageError::already_exists(path, version));
        }
        versions.insert(version.into(), artifacts);

        Ok(())
    }

    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, StorageError> {
        Ok(self
            .packages
            .read()
            .await
            .get(path)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, path: &PackagePath, version: &str) -> Result<(), StorageError> {
        check_version(version)?;
        let mut packages = self.packages.write().await;
        let versions = packages
            .get_mut(path)
            .ok_or_else(|| StorageError::missing(path, version))?;
        versions
            .remove(version)
            .ok_or_else(|| StorageError::missing(path, version))?;
        if versions.is_empty() {
            packages.remove(path);
        }
        Ok(())
    }

    async fn catalog(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<CatalogPage, StorageError> {
        let mut entries: Vec<_> = self
            .packages
            .read()
            .await
            .iter()
            .flat_map(|(path, versions)| {
                versions
                    .keys()
                    .map(move |version| (path.clone(), version.clone()))
            })
            .collect();
        entries.sort();
        paginate(entries, token, page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> PackagePath {
        PackagePath::new("github.com/a/b").unwrap()
    }

    #[tokio::test]
    async fn instances_are_independent() {
        let first = Memory::new();
        let second = Memory::new();

        first
            .save(&path(), "v1.0.0", b"mod", &mut &b"zip"[..], b"info")
            .await
            .unwrap();

        assert!(first.exists(&path(), "v1.0.0").await);
        assert!(!second.exists(&path(), "v1.0.0").await);
        assert_eq!(first.len().await, 1);
        assert!(second.is_empty().await);
    }

    #[tokio::test]
    async fn delete_drops_empty_packages() {
        let storage = Memory::new();
        storage
            .save(&path(), "v1.0.0", b"mod", &mut &b"zip"[..], b"info")
            .await
            .unwrap();

        storage.delete(&path(), "v1.0.0").await.unwrap();

        assert!(storage.packages.read().await.is_empty());
        assert!(matches!(
            storage.delete(&path(), "v1.0.0").await,
            Err(StorageError::Missing { .. })
        ));
    }
}
