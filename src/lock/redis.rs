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

use std::{fmt, time::Duration};

use rand::Rng;
use redis::{Script, aio::ConnectionManager};
use tokio::{task::JoinHandle, time::Instant};

use super::{Lease, Lock, LockError, LockHandle, LockKey};
use crate::errors::shared;

/// Extends the lease, but only while we still own it.
const RENEW: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Deletes the lock, but only while we still own it.
const RELEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Longest pause between two acquisition attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Lock shared between processes through Redis.
///
/// Locks are leases with a time to live, so a crashed holder cannot wedge other processes. While
/// a lock is held, a background task keeps extending its lease.
#[derive(Clone)]
pub struct Redis {
    connection: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl fmt::Debug for Redis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redis")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Redis {
    /// Default prefix of lock keys.
    pub const PREFIX: &'static str = "modstash:lock:";

    /// Connect to the Redis instance at `url`.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = client
            .get_tokio_connection_manager()
            .await
            .map_err(unavailable)?;

        Ok(Self::with_connection(connection, ttl))
    }

    /// Use an existing connection.
    pub fn with_connection(connection: ConnectionManager, ttl: Duration) -> Self {
        Self {
            connection,
            prefix: Self::PREFIX.into(),
            ttl,
        }
    }

    fn name(&self, key: &LockKey) -> String {
        lock_name(&self.prefix, key)
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// Keep extending the lease until aborted or the lease is lost.
    fn renew(&self, name: String, token: String) -> JoinHandle<()> {
        let mut connection = self.connection.clone();
        let ttl = self.ttl_millis();
        let period = (self.ttl / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let script = Script::new(RENEW);
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let renewed: Result<i64, _> = script
                    .key(&name)
                    .arg(&token)
                    .arg(ttl)
                    .invoke_async(&mut connection)
                    .await;

                match renewed {
                    Ok(1) => {}
                    Ok(_) => {
                        tracing::warn!("lease on {name} was lost");
                        break;
                    }
                    Err(error) => tracing::warn!("failed to renew lease on {name}: {error}"),
                }
            }
        })
    }
}

fn lock_name(prefix: &str, key: &LockKey) -> String {
    format!(
        "{prefix}{}@{}",
        key.path().escaped(),
        key.version()
    )
}

fn unavailable(error: redis::RedisError) -> LockError {
    LockError::Unavailable(shared(error))
}

#[async_trait::async_trait]
impl Lock for Redis {
    async fn acquire(&self, key: &LockKey, deadline: Instant) -> Result<LockHandle, LockError> {
        let name = self.name(key);
        let token = hex::encode(rand::random::<u128>().to_be_bytes());
        let mut connection = self.connection.clone();
        let mut backoff = Duration::from_millis(10);

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl_millis())
                .query_async(&mut connection)
                .await
                .map_err(unavailable)?;

            if acquired.is_some() {
                tracing::debug!("acquired {name}");
                let renewal = self.renew(name.clone(), token.clone());
                let lease = RedisLease {
                    connection,
                    name,
                    token,
                    renewal,
                };
                return Ok(LockHandle::new(key.clone(), Box::new(lease)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout(key.clone()));
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..10));
            tokio::time::sleep_until((now + backoff + jitter).min(deadline)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

struct RedisLease {
    connection: ConnectionManager,
    name: String,
    token: String,
    renewal: JoinHandle<()>,
}

impl fmt::Debug for RedisLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLease")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait::async_trait]
impl Lease for RedisLease {
    async fn release(mut self: Box<Self>) -> Result<(), LockError> {
        self.renewal.abort();
        let released: i64 = Script::new(RELEASE)
            .key(&self.name)
            .arg(&self.token)
            .invoke_async(&mut self.connection)
            .await
            .map_err(unavailable)?;

        if released == 0 {
            tracing::warn!("lease on {} expired before release", self.name);
        }
        Ok(())
    }
}

impl Drop for RedisLease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
