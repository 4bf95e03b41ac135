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

use super::*;
use pretty_assertions::assert_eq;

/// Create a temporary in-memory storage.
pub async fn temp_memory() -> (Memory, Cleanup) {
    (Memory::new(), Box::pin(async {}))
}

#[proptest(async = "tokio")]
async fn instances_are_independent(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    let first = Memory::new();
    let second = Memory::new();

    parts.save(&first, &path, &version).await.unwrap();

    assert!(first.exists(&path, &version).await);
    assert!(!second.exists(&path, &version).await);
    assert!(second.is_empty().await);
}

#[proptest(async = "tokio")]
async fn delete_forgets_empty_packages(
    #[strategy(package_path())] path: PackagePath,
    #[strategy(version())] version: String,
    parts: Parts,
) {
    with(temp_memory, |storage| async move {
        parts.save(&storage, &path, &version).await.unwrap();
        assert_eq!(storage.len().await, 1);

        storage.delete(&path, &version).await.unwrap();
        assert!(storage.is_empty().await);
    })
    .await;
}
