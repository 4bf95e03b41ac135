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
    collections::BTreeSet,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use modstash::{package::PackagePath, storage::*};
use pretty_assertions::assert_eq;
use proptest::prop_compose;
use test_strategy::{Arbitrary, proptest};
use tokio::io::{AsyncRead, ReadBuf};

mod filesystem;
mod memory;

/// Generic future used for cleanup tasks.
pub type Cleanup = Pin<Box<dyn Future<Output = ()>>>;

/// Run a closure with a temporary instance and run cleanup afterwards.
pub async fn with<
    S: Storage,
    O1: Future<Output = (S, Cleanup)>,
    F1: Fn() -> O1,
    O2: Future<Output = ()>,
    F2: FnOnce(S) -> O2,
>(
    function: F1,
    closure: F2,
) {
    let (storage, cleanup) = function().await;
    closure(storage).await;
    cleanup.await;
}

/// Create temporary instances of a storage backend. If the cache `feature` is enabled, this will
/// create an additional cached instance.
async fn create_temp_instances<
    S: Storage + 'static,
    O: Future<Output = (S, Cleanup)>,
    F: Fn() -> O,
>(
    storages: &mut Vec<AnyStorage>,
    cleanups: &mut Vec<Cleanup>,
    function: F,
) {
    // create instance
    let (storage, cleanup) = function().await;
    storages.push(Arc::new(storage));
    cleanups.push(cleanup);

    // create cached instance
    #[cfg(feature = "storage-cache")]
    {
        let (storage, cleanup) = function().await;
        storages.push(Arc::new(Cache::new(storage, CacheConfig::default())));
        cleanups.push(cleanup);
    }
}

/// Create temporary instances of all storage providers.
async fn temp_instances() -> (Vec<AnyStorage>, Cleanup) {
    let mut storage: Vec<AnyStorage> = vec![];
    let mut cleanup: Vec<Cleanup> = vec![];

    create_temp_instances(&mut storage, &mut cleanup, memory::temp_memory).await;
    create_temp_instances(&mut storage, &mut cleanup, filesystem::temp_filesystem).await;

    let cleanup = Box::pin(async move {
        for c in cleanup.into_iter() {
            c.await;
        }
    });

    (storage, cleanup)
}

prop_compose! {
    pub fn package_path()(
        host in "[a-z]{1,8}\\.(com|org|io)",
        owner in "[A-Za-z0-9][A-Za-z0-9_.-]{0,11}",
        name in "[A-Za-z0-9][A-Za-z0-9_.~-]{0,11}",
    ) -> PackagePath {
        PackagePath::new(format!("{host}/{owner}/{name}")).unwrap()
    }
}

prop_compose! {
    pub fn version()(major: u16, minor: u16, patch: u16) -> String {
        format!("v{major}.{minor}.{patch}")
    }
}

/// Parts of a package version, as handed to [`Storage::save`].
#[derive(Arbitrary, Clone, Debug)]
pub struct Parts {
    pub info: Vec<u8>,
    pub manifest: Vec<u8>,
    pub archive: Vec<u8>,
}

impl Parts {
    pub async fn save(
        &self,
        storage: &dyn Storage,
        path: &PackagePath,
        version: &str,
    ) -> Result<(), StorageError> {
        let mut archive = &self.archive[..];
        storage
            .save(path, version, &self.manifest, &mut archive, &self.info)
            .await
    }
}

/// Archive stream that breaks down after yielding some data.
pub struct Failing {
    remaining: Vec<u8>,
}

impl Failing {
    pub fn new(prefix: &[u8]) -> Self {
        Self {
            remaining: prefix.to_vec(),
        }
    }
}

impl AsyncRead for Failing {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "upstream went away",
            )));
        }

        let count = self.remaining.len().min(buf.remaining());
        let chunk: Vec<u8> = self.remaining.drain(..count).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[proptest(async = "tokio", cases = 10)]
async fn can_save_and_get(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    let (instances, cleanup) = temp_instances().await;

    for storage in instances {
        println!("Testing {storage:?}");

        assert!(!storage.exists(&path, &version).await);
        let result = storage.get(&path, &version).await;
        assert!(matches!(result, Err(StorageError::Missing { .. })));

        parts.save(&*storage, &path, &version).await.unwrap();

        assert!(storage.exists(&path, &version).await);
        let artifacts = storage.get(&path, &version).await.unwrap();
        assert_eq!(artifacts.info, parts.info);
        assert_eq!(artifacts.manifest, parts.manifest);
        assert_eq!(artifacts.archive, parts.archive);
    }

    cleanup.await;
}

#[proptest(async = "tokio", cases = 10)]
async fn cannot_overwrite(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    first: Parts,
    second: Parts,
) {
    let (instances, cleanup) = temp_instances().await;

    for storage in instances {
        println!("Testing {storage:?}");

        first.save(&*storage, &path, &version).await.unwrap();
        let result = second.save(&*storage, &path, &version).await;
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));

        let artifacts = storage.get(&path, &version).await.unwrap();
        assert_eq!(artifacts.archive, first.archive);
        assert_eq!(artifacts.info, first.info);
    }

    cleanup.await;
}

#[proptest(async = "tokio", cases = 10)]
async fn failed_save_leaves_nothing(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    let (instances, cleanup) = temp_instances().await;

    for storage in instances {
        println!("Testing {storage:?}");

        let mut archive = Failing::new(&parts.archive);
        let result = storage
            .save(&path, &version, &parts.manifest, &mut archive, &parts.info)
            .await;
        assert!(result.is_err());

        assert!(!storage.exists(&path, &version).await);
        let result = storage.get(&path, &version).await;
        assert!(matches!(result, Err(StorageError::Missing { .. })));
        assert!(storage.list(&path).await.unwrap().is_empty());

        // a retry goes through
        parts.save(&*storage, &path, &version).await.unwrap();
        assert!(storage.exists(&path, &version).await);
    }

    cleanup.await;
}

#[proptest(async = "tokio", cases = 10)]
async fn can_list(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(proptest::collection::btree_set(version(), 0..5))] versions: BTreeSet<String>,
    parts: Parts,
) {
    let (instances, cleanup) = temp_instances().await;

    for storage in instances {
        println!("Testing {storage:?}");

        for version in &versions {
            parts.save(&*storage, &path, version).await.unwrap();
        }

        let listed: BTreeSet<String> = storage.list(&path).await.unwrap().into_iter().collect();
        assert_eq!(listed, versions);
    }

    cleanup.await;
}

#[proptest(async = "tokio", cases = 10)]
async fn can_delete(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    let (instances, cleanup) = temp_instances().await;

    for storage in instances {
        println!("Testing {storage:?}");

        let result = storage.delete(&path, &version).await;
        assert!(matches!(result, Err(StorageError::Missing { .. })));

        parts.save(&*storage, &path, &version).await.unwrap();
        assert!(storage.exists(&path, &version).await);

        storage.delete(&path, &version).await.unwrap();
        assert!(!storage.exists(&path, &version).await);
        let result = storage.get(&path, &version).await;
        assert!(matches!(result, Err(StorageError::Missing { .. })));

        // deleted versions may be stored again
        parts.save(&*storage, &path, &version).await.unwrap();
    }

    cleanup.await;
}

#[proptest(async = "tokio", cases = 10)]
async fn catalog_visits_everything_once(
    #[strategy(proptest::collection::btree_set((package_path(), version()), 0..12))]
    entries: BTreeSet<(PackagePath, String)>,
    #[strategy(1usize..5)] page_size: usize,
) {
    let (instances, cleanup) = temp_instances().await;
    let parts = Parts {
        info: b"{}".to_vec(),
        manifest: b"module x".to_vec(),
        archive: b"PK".to_vec(),
    };

    for storage in instances {
        println!("Testing {storage:?}");

        for (path, version) in &entries {
            parts.save(&*storage, path, version).await.unwrap();
        }

        let mut seen = vec![];
        let mut token: Option<String> = None;
        loop {
            let page = storage.catalog(token.as_deref(), page_size).await.unwrap();
            assert!(page.entries.len() <= page_size);
            seen.extend(page.entries);
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let expected: Vec<_> = entries.iter().cloned().collect();
        assert_eq!(seen, expected);
    }

    cleanup.await;
}

#[tokio::test]
async fn rejects_unsafe_versions() {
    let (instances, cleanup) = temp_instances().await;
    let path = PackagePath::new("github.com/a/b").unwrap();

    for storage in instances {
        for version in ["", "..", "v1.0.0/../../etc", "v1 0"] {
            let mut archive: &[u8] = b"PK";
            let result = storage.save(&path, version, b"", &mut archive, b"").await;
            assert!(
                matches!(result, Err(StorageError::BadRequest(_))),
                "{version:?} accepted by {storage:?}"
            );
            assert!(!storage.exists(&path, version).await);
        }
    }

    cleanup.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_keep_one_copy() {
    let (instances, cleanup) = temp_instances().await;
    let path = PackagePath::new("github.com/a/b").unwrap();
    let parts = |marker: u8| Parts {
        info: vec![marker; 16],
        manifest: vec![marker; 32],
        archive: vec![marker; 4096],
    };

    for storage in instances {
        println!("Testing {storage:?}");

        let saves: Vec<_> = (0..8u8)
            .map(|marker| {
                let storage = storage.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    let parts = parts(marker);
                    (parts.save(&*storage, &path, "v1.0.0").await, parts)
                })
            })
            .collect();

        let mut winners = vec![];
        for save in saves {
            match save.await.unwrap() {
                (Ok(()), parts) => winners.push(parts),
                (Err(StorageError::AlreadyExists { .. }), _) => {}
                (Err(error), _) => panic!("unexpected error: {error}"),
            }
        }
        assert_eq!(winners.len(), 1);

        let artifacts = storage.get(&path, "v1.0.0").await.unwrap();
        assert_eq!(artifacts.info, winners[0].info);
        assert_eq!(artifacts.manifest, winners[0].manifest);
        assert_eq!(artifacts.archive, winners[0].archive);
    }

    cleanup.await;
}
