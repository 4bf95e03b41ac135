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

//! Tests for [`Filesystem`].
//!
//! Every test uses a new temporary location created by [`temp_filesystem`], so tests do not
//! interfere with each other. Setup and verification use plain filesystem operations.

use super::*;
use pretty_assertions::assert_eq;

use tempfile::TempDir;

/// Create a temporary filesystem storage.
pub async fn temp_filesystem() -> (Filesystem, Cleanup) {
    let dir = TempDir::new().unwrap();
    let storage = Filesystem::new(dir.path().to_path_buf());
    let cleanup = async move {
        dir.close().unwrap();
    };
    (storage, Box::pin(cleanup))
}

/// Names of all entries directly below `path`.
async fn entries(path: &std::path::Path) -> Vec<String> {
    let mut names = vec![];
    let mut directory = tokio::fs::read_dir(path).await.unwrap();
    while let Some(entry) = directory.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

#[proptest(async = "tokio")]
async fn can_write_version(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    with(temp_filesystem, |storage| async move {
        parts.save(&storage, &path, &version).await.unwrap();

        let directory = storage.version_path(&path, &version);
        assert!(directory.starts_with(storage.path().join(path.escaped())));

        let found = tokio::fs::read(directory.join(format!("{version}.zip")))
            .await
            .unwrap();
        assert_eq!(found, parts.archive);
        let found = tokio::fs::read(directory.join(format!("{version}.mod")))
            .await
            .unwrap();
        assert_eq!(found, parts.manifest);
        let found = tokio::fs::read(directory.join(format!("{version}.info")))
            .await
            .unwrap();
        assert_eq!(found, parts.info);

        // nothing but the escaped host below the root
        let host = path.escaped().split('/').next().unwrap().to_string();
        assert_eq!(entries(storage.path()).await, vec![host]);
    })
    .await;
}

#[proptest(async = "tokio")]
async fn failed_write_is_cleaned_up(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    with(temp_filesystem, |storage| async move {
        let mut archive = Failing::new(&parts.archive);
        let result = storage
            .save(&path, &version, &parts.manifest, &mut archive, &parts.info)
            .await;
        assert!(result.is_err());

        assert!(!storage.version_path(&path, &version).exists());
        let leftovers: Vec<_> = entries(storage.path())
            .await
            .into_iter()
            .filter(|name| name.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "leftover staging {leftovers:?}");
    })
    .await;
}

#[proptest(async = "tokio")]
async fn cannot_read_incomplete_version(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    manifest: Vec<u8>,
) {
    with(temp_filesystem, |storage| async move {
        let directory = storage.version_path(&path, &version);
        tokio::fs::create_dir_all(&directory).await.unwrap();
        tokio::fs::write(directory.join(format!("{version}.mod")), &manifest)
            .await
            .unwrap();

        assert!(!storage.exists(&path, &version).await);
        let result = storage.get(&path, &version).await;
        assert!(matches!(result, Err(StorageError::Missing { .. })));
    })
    .await;
}
