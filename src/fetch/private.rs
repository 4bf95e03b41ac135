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

use std::{fmt, path::PathBuf};

use serde::Deserialize;

use super::{FetchError, Fetcher, Staged, Tool, Workspace};
use crate::{errors::Op, package::PackagePath};

/// Credential bound to exactly one host.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct HostCredential {
    /// Host the credential is valid for.
    pub host: String,
    /// User name.
    pub username: String,
    /// Password or access token.
    pub password: String,
}

impl HostCredential {
    /// Determine if this binding is usable at all.
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() || self.password.is_empty()
    }

    /// Render the binding as a netrc entry.
    fn netrc(&self) -> String {
        format!(
            "machine {} login {} password {}\n",
            self.host, self.username, self.password
        )
    }
}

impl fmt::Debug for HostCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCredential")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Removes a credential file when dropped.
struct Scrub(PathBuf);

impl Drop for Scrub {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => tracing::error!("failed to scrub {}: {error}", self.0.display()),
        }
    }
}

/// Fetcher for packages that need credentials.
///
/// Only paths on the bound host are fetched; anything else is refused before any process is
/// started. The credential is written into the workspace for the duration of the toolchain run
/// and scrubbed afterwards, whatever the outcome.
#[derive(Clone, Debug)]
pub struct Private {
    tool: Tool,
    credential: HostCredential,
}

impl Private {
    const NETRC: &'static str = ".netrc";

    /// Create a fetcher bound to a single host credential.
    pub fn new(tool: &Tool, credential: HostCredential) -> Self {
        Self {
            tool: tool.private(&credential.host),
            credential,
        }
    }

    /// Host this fetcher is bound to.
    pub fn host(&self) -> &str {
        &self.credential.host
    }

    async fn write_netrc(&self, workspace: &Workspace) -> Result<PathBuf, FetchError> {
        let home = workspace.home();
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))?;

        let file = home.join(Self::NETRC);
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut handle = options
            .open(&file)
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))?;
        tokio::io::AsyncWriteExt::write_all(&mut handle, self.credential.netrc().as_bytes())
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))?;

        Ok(file)
    }
}

impl Private {
    /// Refuse paths the credential is not bound to.
    fn authorize(&self, path: &PackagePath) -> Result<(), FetchError> {
        if self.credential.is_empty() || path.host() != self.credential.host {
            tracing::warn!("refusing to fetch {path} with credential for {}", self.host());
            return Err(FetchError::Unauthorized {
                host: path.host().into(),
            });
        }
        Ok(())
    }

    /// Create a workspace holding the credential, and the guard scrubbing it.
    async fn prepare(&self) -> Result<(Workspace, Scrub), FetchError> {
        let workspace = Workspace::new()?;
        let netrc = self.write_netrc(&workspace).await;
        // scrub even if writing failed half way.
        let scrub = Scrub(workspace.home().join(Self::NETRC));
        netrc?;
        Ok((workspace, scrub))
    }
}

#[async_trait::async_trait]
impl Fetcher for Private {
    async fn fetch(&self, path: &PackagePath, version: &str) -> Result<Staged, FetchError> {
        self.authorize(path)?;
        let (workspace, _scrub) = self.prepare().await?;
        self.tool.fetch_in(workspace, path, version).await
    }

    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, FetchError> {
        self.authorize(path)?;
        let (workspace, _scrub) = self.prepare().await?;
        self.tool.resolve_in(&workspace, path, version).await
    }
}
