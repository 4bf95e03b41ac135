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

//! # Configuration file
//!
//! All components are selected once, at startup, from a TOML file:
//!
//! ```toml
//! # applies to fetching, waiting for the lock and storage
//! timeout = 300
//!
//! [filter]
//! file = "filter.conf"
//!
//! [[filter.rules]]
//! prefix = "git.example.com"
//! disposition = "private"
//!
//! [storage]
//! kind = "filesystem"
//! path = "/var/lib/modstash"
//!
//! [cache]
//! capacity = 268435456
//!
//! [fetcher]
//! kind = "mirror"
//! url = "https://proxy.golang.org"
//!
//! [lock]
//! kind = "redis"
//! url = "redis://localhost:6379"
//! ttl = 30
//!
//! [private]
//! host = "git.example.com"
//! username = "modstash"
//! password = "hunter2"
//! ```
//!
//! Every section is optional. Without any, packages are fetched with the local toolchain into
//! memory and coordinated by an in-process lock.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use url::Url;

use crate::{
    fetch::{HostCredential, ToolConfig},
    filter::{Filter, FilterError, Rule},
};
#[cfg(feature = "storage-cache")]
use crate::storage::CacheConfig;

/// Error loading the configuration.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config file {path}")]
    Read {
        /// Configuration file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Configuration is not valid TOML or does not match the schema.
    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    /// Configuration parses, but makes no sense.
    #[error("invalid config: {0}")]
    #[diagnostic(help("check the configuration file against the documented format"))]
    Invalid(String),

    /// Filter rules could not be loaded.
    #[error("failed to load filter")]
    Filter(#[from] FilterError),
}

/// Storage backend selection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Keep everything in memory.
    #[default]
    Memory,
    /// Store below a local directory.
    Filesystem {
        /// Root directory.
        path: PathBuf,
    },
    /// Store in an S3 bucket.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Custom endpoint, for S3 compatible services.
        #[serde(default)]
        endpoint: Option<Url>,
    },
}

/// Fetcher selection.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FetcherConfig {
    /// Drive the package toolchain.
    Tool(ToolConfig),
    /// Pull from another proxy.
    Mirror {
        /// Base URL of the mirror.
        url: Url,
    },
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self::Tool(ToolConfig::default())
    }
}

/// Lock backend selection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LockConfig {
    /// Coordinate within this process only.
    #[default]
    Local,
    /// Coordinate through Redis.
    Redis {
        /// Connection URL.
        url: String,
        /// Lease time to live, in seconds.
        #[serde(default = "default_lease")]
        ttl: u64,
    },
}

fn default_lease() -> u64 {
    30
}

/// Filter rules.
///
/// Rules from `file` are loaded first, `rules` are applied on top of them in order.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// File in the line based filter format.
    pub file: Option<PathBuf>,
    /// Rules given inline.
    pub rules: Vec<Rule>,
}

impl FilterConfig {
    /// Build the filter these rules describe.
    pub async fn load(&self) -> Result<Filter, FilterError> {
        let mut filter = match &self.file {
            Some(file) => Filter::load(file).await?,
            None => Filter::new(),
        };

        for rule in &self.rules {
            filter.add_rule(rule.prefix.as_str(), rule.disposition);
        }

        Ok(filter)
    }
}

/// Configuration of a proxy instance.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Timeout in seconds, for fetching, waiting for the lock and storage.
    pub timeout: u64,
    /// Path filter.
    pub filter: FilterConfig,
    /// Storage backend.
    pub storage: StorageConfig,
    /// Read cache in front of the storage backend.
    #[cfg(feature = "storage-cache")]
    pub cache: Option<CacheConfig>,
    /// How packages are fetched.
    pub fetcher: FetcherConfig,
    /// How fetches are coordinated.
    pub lock: LockConfig,
    /// Credential for packages the filter marks as private.
    pub private: Option<HostCredential>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: 300,
            filter: FilterConfig::default(),
            storage: StorageConfig::default(),
            #[cfg(feature = "storage-cache")]
            cache: None,
            fetcher: FetcherConfig::default(),
            lock: LockConfig::default(),
            private: None,
        }
    }
}

impl Config {
    /// Load the configuration from a file.
    ///
    /// Relative paths in the file are taken relative to the directory containing it.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| ConfigError::Read {
                path: path.into(),
                error,
            })?;

        let mut config: Self = text.parse()?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }

        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Timeout applied to fetching, waiting for the lock and storage.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn rebase(&mut self, base: &Path) {
        if let Some(file) = &mut self.filter.file {
            *file = base.join(&*file);
        }
        if let StorageConfig::Filesystem { path } = &mut self.storage {
            *path = base.join(&*path);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::Invalid("timeout must be positive".into()));
        }

        if let LockConfig::Redis { ttl: 0, .. } = self.lock {
            return Err(ConfigError::Invalid("lock ttl must be positive".into()));
        }

        if let Some(private) = &self.private {
            if private.is_empty() {
                return Err(ConfigError::Invalid(
                    "private credential needs a host and a password".into(),
                ));
            }
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }
}
