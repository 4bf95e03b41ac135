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
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use modstash::{
    errors::Kind,
    fetch::{FetchError, Fetcher, Lister, Staged},
    filter::{Disposition, Filter},
    lock::Local,
    package::{Artifacts, PackagePath, VersionInfo},
    protocol::Protocol,
    stash::{AnyStasher, Fetching, SingleFlight, StashError},
    storage::{AnyStorage, Memory, Storage, StorageError},
};
use pretty_assertions::assert_eq;
use tokio::io::AsyncRead;

/// Storage that never answers.
#[derive(Debug)]
struct Stalled;

async fn stall<T>() -> T {
    std::future::pending().await
}

#[async_trait::async_trait]
impl Storage for Stalled {
    async fn exists(&self, _path: &PackagePath, _version: &str) -> bool {
        stall().await
    }

    async fn get(&self, _path: &PackagePath, _version: &str) -> Result<Artifacts, StorageError> {
        stall().await
    }

    async fn save(
        &self,
        _path: &PackagePath,
        _version: &str,
        _manifest: &[u8],
        _archive: &mut (dyn AsyncRead + Send + Unpin),
        _info: &[u8],
    ) -> Result<(), StorageError> {
        stall().await
    }

    async fn list(&self, _path: &PackagePath) -> Result<Vec<String>, StorageError> {
        stall().await
    }

    async fn delete(&self, _path: &PackagePath, _version: &str) -> Result<(), StorageError> {
        stall().await
    }
}

/// Upstream serving a fixed set of versions for every path.
#[derive(Debug)]
struct Upstream {
    versions: Result<Vec<String>, FetchError>,
    calls: AtomicUsize,
}

impl Upstream {
    fn new(versions: &[&str]) -> Self {
        Self {
            versions: Ok(versions.iter().map(|version| version.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(error: FetchError) -> Self {
        Self {
            versions: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Lister for Upstream {
    async fn list(&self, _path: &PackagePath) -> Result<Vec<String>, FetchError> {
        self.versions.clone()
    }

    async fn latest(&self, _path: &PackagePath) -> Result<VersionInfo, FetchError> {
        let versions = self.versions.clone()?;
        let version = versions.last().cloned().unwrap_or_default();
        Ok(VersionInfo {
            version,
            time: None,
        })
    }
}

#[async_trait::async_trait]
impl Fetcher for Upstream {
    async fn fetch(&self, path: &PackagePath, version: &str) -> Result<Staged, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let artifacts = Artifacts {
            info: Bytes::from(format!(r#"{{"Version":"{version}"}}"#)),
            manifest: Bytes::from(format!("module {path}\n")),
            archive: Bytes::from_static(b"PK"),
        };
        Ok(Staged::memory(path, version, artifacts))
    }

    async fn resolve(&self, _path: &PackagePath, version: &str) -> Result<String, FetchError> {
        Ok(version.to_string())
    }
}

fn stasher(fetcher: Arc<Upstream>, storage: &AnyStorage) -> AnyStasher {
    let inner = Arc::new(Fetching::new(fetcher, storage.clone()));
    Arc::new(SingleFlight::new(
        storage.clone(),
        inner,
        Arc::new(Local::new()),
        Duration::from_secs(10),
    ))
}

fn filter() -> Filter {
    let mut filter = Filter::new();
    filter.add_rule("github.com/secret", Disposition::Exclude);
    filter.add_rule("git.example.com", Disposition::Private);
    filter
}

fn path(path: &str) -> PackagePath {
    PackagePath::new(path).unwrap()
}

async fn store(storage: &AnyStorage, path: &PackagePath, version: &str) {
    let mut archive: &[u8] = b"PK";
    storage
        .save(path, version, b"module x\n", &mut archive, b"{}")
        .await
        .unwrap();
}

fn protocol(upstream: Upstream, private: Option<Arc<Upstream>>) -> (Protocol, AnyStorage) {
    let storage: AnyStorage = Arc::new(Memory::new());
    let upstream = Arc::new(upstream);
    let private = private.map(|fetcher| stasher(fetcher, &storage));
    let protocol = Protocol::new(
        filter(),
        storage.clone(),
        upstream.clone(),
        stasher(upstream, &storage),
        private,
    );
    (protocol, storage)
}

#[tokio::test]
async fn lists_stored_and_upstream_versions() {
    let (protocol, storage) = protocol(Upstream::new(&["v1.10.0", "v1.2.0", "v1.9.0"]), None);
    let errors = path("github.com/pkg/errors");
    store(&storage, &errors, "v1.2.0").await;
    store(&storage, &errors, "v0.9.1").await;

    let versions = protocol.list(&errors).await.unwrap();
    assert_eq!(versions, vec!["v0.9.1", "v1.2.0", "v1.9.0", "v1.10.0"]);
}

#[tokio::test]
async fn listing_survives_upstream_failures() {
    let error = FetchError::RateLimited("slow down".into());
    let (protocol, storage) = protocol(Upstream::failing(error), None);
    let errors = path("github.com/pkg/errors");
    store(&storage, &errors, "v0.9.1").await;

    assert_eq!(protocol.list(&errors).await.unwrap(), vec!["v0.9.1"]);
}

#[tokio::test]
async fn latest_falls_back_to_storage() {
    let error = FetchError::RateLimited("slow down".into());
    let (protocol, storage) = protocol(Upstream::failing(error), None);
    let errors = path("github.com/pkg/errors");

    let error = protocol.latest(&errors).await.unwrap_err();
    assert_eq!(error.kind(), Kind::RateLimited);

    store(&storage, &errors, "v0.8.0").await;
    store(&storage, &errors, "v0.10.0").await;
    store(&storage, &errors, "v0.0.0-20230901120000-abcdefabcdef").await;

    let latest = protocol.latest(&errors).await.unwrap();
    assert_eq!(latest.version, "v0.10.0");
}

#[tokio::test]
async fn materializes_once() {
    let upstream = Upstream::new(&[]);
    let storage: AnyStorage = Arc::new(Memory::new());
    let upstream = Arc::new(upstream);
    let protocol = Protocol::new(
        Filter::new(),
        storage.clone(),
        upstream.clone(),
        stasher(upstream.clone(), &storage),
        None,
    );
    let errors = path("github.com/pkg/errors");

    assert!(!protocol.exists(&errors, "v0.9.1").await);
    let (version, artifacts) = protocol.materialize(&errors, "v0.9.1").await.unwrap();
    assert_eq!(version, "v0.9.1");
    assert_eq!(artifacts.manifest, "module github.com/pkg/errors\n".as_bytes());
    assert!(protocol.exists(&errors, "v0.9.1").await);

    protocol.materialize(&errors, "v0.9.1").await.unwrap();
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn excluded_paths_are_refused() {
    let (protocol, storage) = protocol(Upstream::new(&["v1.0.0"]), None);
    let secret = path("github.com/secret/plans");
    store(&storage, &secret, "v1.0.0").await;

    let error = protocol.materialize(&secret, "v1.0.0").await.unwrap_err();
    assert!(matches!(error, StashError::Excluded(_)));
    assert_eq!(error.kind(), Kind::NotFound);
    assert!(!protocol.exists(&secret, "v1.0.0").await);
    assert!(protocol.list(&secret).await.is_err());
}

#[tokio::test]
async fn private_paths_need_a_credential() {
    let (protocol, _) = protocol(Upstream::new(&[]), None);
    let internal = path("git.example.com/team/lib");

    let error = protocol.materialize(&internal, "v1.0.0").await.unwrap_err();
    assert_eq!(error.kind(), Kind::BadRequest);
}

#[tokio::test]
async fn private_paths_use_the_private_fetcher() {
    let private = Arc::new(Upstream::new(&[]));
    let (protocol, _) = protocol(Upstream::new(&["v9.9.9"]), Some(private.clone()));
    let internal = path("git.example.com/team/lib");

    protocol.materialize(&internal, "v1.0.0").await.unwrap();
    assert_eq!(private.calls(), 1);

    // private packages are only listed from storage
    assert_eq!(protocol.list(&internal).await.unwrap(), vec!["v1.0.0"]);
}

#[tokio::test]
async fn latest_prefers_stored_releases() {
    let error = FetchError::RateLimited("slow down".into());
    let (protocol, storage) = protocol(Upstream::failing(error), None);
    let errors = path("github.com/pkg/errors");

    store(&storage, &errors, "v1.2.4-0.20230901120000-abcdefabcdef").await;
    assert_eq!(
        protocol.latest(&errors).await.unwrap().version,
        "v1.2.4-0.20230901120000-abcdefabcdef"
    );

    store(&storage, &errors, "v1.2.3").await;
    assert_eq!(protocol.latest(&errors).await.unwrap().version, "v1.2.3");
}

#[tokio::test]
async fn stalled_storage_times_out() {
    let timeout = Duration::from_millis(50);
    let storage: AnyStorage = Arc::new(Stalled);
    let upstream = Arc::new(Upstream::new(&["v1.0.0"]));
    let inner = Arc::new(Fetching::new(upstream.clone(), storage.clone()));
    let stasher = Arc::new(SingleFlight::new(
        storage.clone(),
        inner,
        Arc::new(Local::new()),
        timeout,
    ));
    let protocol =
        Protocol::new(Filter::new(), storage, upstream, stasher, None).with_timeout(timeout);
    let errors = path("github.com/pkg/errors");

    let bounded = Duration::from_secs(5);
    let materialized = tokio::time::timeout(bounded, protocol.materialize(&errors, "v1.0.0"))
        .await
        .unwrap();
    assert_eq!(materialized.unwrap_err().kind(), Kind::Unexpected);

    let listed = tokio::time::timeout(bounded, protocol.list(&errors))
        .await
        .unwrap();
    assert_eq!(listed.unwrap_err().kind(), Kind::Unexpected);

    let exists = tokio::time::timeout(bounded, protocol.exists(&errors, "v1.0.0"))
        .await
        .unwrap();
    assert!(!exists);
}
