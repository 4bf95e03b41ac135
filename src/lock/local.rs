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
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{sync::OwnedMutexGuard, time::Instant};

use super::{Lease, Lock, LockError, LockHandle, LockKey};

type Table = Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>;

/// In-process lock.
///
/// Keeps one mutex per key for as long as anybody holds or waits for it.
#[derive(Clone, Debug, Default)]
pub struct Local {
    table: Table,
}

impl Local {
    /// Create a new, empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        table(&self.table).len()
    }

    /// Determine if no key is held or waited for.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn table(table: &Table) -> MutexGuard<'_, HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>> {
    // the table is consistent after every operation, so a poisoned lock is still usable.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the entry for `key` if nobody but the table references it.
fn prune(table_ref: &Table, key: &LockKey) {
    let mut table = table(table_ref);
    if table
        .get(key)
        .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
    {
        table.remove(key);
    }
}

#[async_trait::async_trait]
impl Lock for Local {
    async fn acquire(&self, key: &LockKey, deadline: Instant) -> Result<LockHandle, LockError> {
        let mutex = table(&self.table).entry(key.clone()).or_default().clone();

        match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockHandle::new(
                key.clone(),
                Box::new(LocalLease {
                    key: key.clone(),
                    guard: Some(guard),
                    table: self.table.clone(),
                }),
            )),
            Err(_) => {
                prune(&self.table, key);
                Err(LockError::Timeout(key.clone()))
            }
        }
    }
}

#[derive(Debug)]
struct LocalLease {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    table: Table,
}

#[async_trait::async_trait]
impl Lease for LocalLease {
    async fn release(self: Box<Self>) -> Result<(), LockError> {
        drop(self);
        Ok(())
    }
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.table, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::package::PackagePath;

    fn key(version: &str) -> LockKey {
        LockKey::new(&PackagePath::new("github.com/a/b").unwrap(), version)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn excludes_concurrent_holders() {
        let lock = Local::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let handle = lock.acquire(&key("v1.0.0"), deadline()).await.unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    handle.release().await.unwrap();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let lock = Local::new();
        let first = lock.acquire(&key("v1.0.0"), deadline()).await.unwrap();
        let second = lock.acquire(&key("v1.1.0"), deadline()).await.unwrap();
        assert_eq!(lock.len(), 2);

        first.release().await.unwrap();
        second.release().await.unwrap();
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn times_out_at_deadline() {
        let lock = Local::new();
        let held = lock.acquire(&key("v1.0.0"), deadline()).await.unwrap();

        let result = lock
            .acquire(
                &key("v1.0.0"),
                Instant::now() + Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(LockError::Timeout(_))));

        // the holder keeps its entry
        assert_eq!(lock.len(), 1);
        held.release().await.unwrap();
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn dropped_handle_releases() {
        let lock = Local::new();
        let held = lock.acquire(&key("v1.0.0"), deadline()).await.unwrap();
        drop(held);

        let again = lock
            .acquire(
                &key("v1.0.0"),
                Instant::now() + Duration::from_millis(20),
            )
            .await;
        assert!(again.is_ok());
    }
}
