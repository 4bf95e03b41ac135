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
    ffi::OsString,
    path::{Path, PathBuf},
    process::Output,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};
use tokio::process::Command;

use super::{FetchError, Fetcher, Lister, Staged, Workspace, check_resolved};
use crate::{
    errors::Op,
    package::{PackagePath, VersionInfo, version},
};

/// Variables passed through to the toolchain when set.
const PASSTHROUGH: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "GIT_SSH",
    "GIT_SSH_COMMAND",
    "SSH_AUTH_SOCK",
];

/// Configuration for the [`Tool`] fetcher.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Toolchain binary.
    pub binary: PathBuf,
    /// Upstream the toolchain resolves packages through (`GOPROXY`).
    pub proxy: String,
    /// Path patterns that skip checksum verification (`GONOSUMDB`).
    pub no_sum_db: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "go".into(),
            proxy: "direct".into(),
            no_sum_db: vec![],
        }
    }
}

/// Failure reported by the toolchain.
#[derive(thiserror::Error, Debug)]
#[error("{command} failed: {message}")]
struct ToolError {
    command: String,
    message: String,
}

/// Output of `go mod download -json`.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
struct Download {
    #[serde(default)]
    version: String,
    info: Option<PathBuf>,
    go_mod: Option<PathBuf>,
    zip: Option<PathBuf>,
    error: Option<String>,
}

/// Output of `go list -m -json`.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
struct Module {
    #[serde(default)]
    version: String,
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    versions: Vec<String>,
    error: Option<ModuleError>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
struct ModuleError {
    err: String,
}

/// Fetcher driving the package toolchain.
///
/// Every fetch runs in its own workspace with an environment built from scratch, so nothing
/// from the host leaks into the toolchain apart from the variables it needs to reach upstream.
/// Child processes are killed when the fetch is cancelled.
#[derive(Clone, Debug)]
pub struct Tool {
    config: ToolConfig,
    private: Vec<String>,
}

impl Tool {
    /// Create a new toolchain fetcher.
    pub fn new(config: ToolConfig) -> Self {
        Self {
            config,
            private: vec![],
        }
    }

    /// Derive a fetcher for packages served by a private host.
    ///
    /// Private packages bypass any configured upstream and the checksum database.
    pub(crate) fn private(&self, host: &str) -> Self {
        Self {
            config: ToolConfig {
                proxy: "direct".into(),
                ..self.config.clone()
            },
            private: vec![host.into()],
        }
    }

    /// Environment for a child process running inside `workspace`.
    fn environment(&self, workspace: &Path) -> Vec<(String, OsString)> {
        let gopath = workspace.join("gopath");
        let mut env: Vec<(String, OsString)> = vec![
            ("HOME".into(), workspace.join("home").into()),
            ("GOPATH".into(), gopath.clone().into()),
            ("GOCACHE".into(), gopath.join("cache").into()),
            ("GOMODCACHE".into(), gopath.join("pkg").join("mod").into()),
            ("GOPROXY".into(), self.config.proxy.clone().into()),
            ("GOFLAGS".into(), "-modcacherw".into()),
            ("GO111MODULE".into(), "on".into()),
            ("CGO_ENABLED".into(), "0".into()),
            ("GIT_TERMINAL_PROMPT".into(), "0".into()),
        ];

        if let Some(path) = std::env::var_os("PATH") {
            env.push(("PATH".into(), path));
        }

        let mut no_sum_db = self.config.no_sum_db.clone();
        no_sum_db.extend(self.private.iter().cloned());
        if !no_sum_db.is_empty() {
            env.push(("GONOSUMDB".into(), no_sum_db.join(",").into()));
        }
        if !self.private.is_empty() {
            env.push(("GOPRIVATE".into(), self.private.join(",").into()));
        }

        for name in PASSTHROUGH {
            if let Some(value) = std::env::var_os(name) {
                env.push((name.to_string(), value));
            }
        }

        env
    }

    /// Run the toolchain inside a workspace.
    async fn run(&self, workspace: &Workspace, args: &[&str]) -> Result<Output, FetchError> {
        let home = workspace.home();
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))?;

        tracing::debug!("running {} {}", self.config.binary.display(), args.join(" "));

        Command::new(&self.config.binary)
            .args(args)
            .env_clear()
            .envs(self.environment(workspace.path()))
            .current_dir(workspace.path())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))
    }

    /// Run the toolchain and decode its JSON output.
    ///
    /// The toolchain reports failures on stdout as well, so the output is decoded even when it
    /// exits with an error.
    async fn run_json<T: DeserializeOwned + Default>(
        &self,
        workspace: &Workspace,
        args: &[&str],
    ) -> Result<(T, Option<String>), FetchError> {
        let output = self.run(workspace, args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let decoded = serde_json::from_str::<T>(&stdout);
        if output.status.success() {
            let decoded = decoded.map_err(|error| FetchError::unexpected(Op::Fetch, error))?;
            return Ok((decoded, None));
        }

        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Ok((decoded.unwrap_or_default(), Some(message)))
    }

    /// Ask the toolchain about a version query.
    async fn query(
        &self,
        workspace: &Workspace,
        path: &PackagePath,
        query: &str,
    ) -> Result<VersionInfo, FetchError> {
        let target = format!("{path}@{query}");
        let (module, failure): (Module, _) = self
            .run_json(workspace, &["list", "-m", "-json", &target])
            .await?;

        if let Some(message) = module.error.map(|error| error.err).or(failure) {
            return Err(classify("go list", path, query, message));
        }

        Ok(VersionInfo {
            version: module.version,
            time: module.time,
        })
    }

    /// Resolve a version query inside an existing workspace.
    pub(crate) async fn resolve_in(
        &self,
        workspace: &Workspace,
        path: &PackagePath,
        version: &str,
    ) -> Result<String, FetchError> {
        version::validate(version)?;

        if version::is_canonical(version) {
            return Ok(version.to_string());
        }

        let info = self.query(workspace, path, version).await?;
        check_resolved(path, version, info)
    }

    /// Fetch a package version into an existing workspace.
    pub(crate) async fn fetch_in(
        &self,
        workspace: Workspace,
        path: &PackagePath,
        version: &str,
    ) -> Result<Staged, FetchError> {
        let version = self.resolve_in(&workspace, path, version).await?;

        let target = format!("{path}@{version}");
        let (download, failure): (Download, _) = self
            .run_json(&workspace, &["mod", "download", "-json", &target])
            .await?;

        if let Some(message) = download.error.or(failure) {
            return Err(classify("go mod download", path, &version, message));
        }

        if !download.version.is_empty() && download.version != version {
            tracing::warn!(
                "toolchain reported {} while downloading {target}",
                download.version
            );
        }

        let info = check_file(download.info, "info").await?;
        let manifest = check_file(download.go_mod, "mod").await?;
        let archive = check_file(download.zip, "zip").await?;

        Ok(Staged::disk(
            path, &version, workspace, info, manifest, archive,
        ))
    }
}

/// Ensure the toolchain produced a non-empty file.
async fn check_file(file: Option<PathBuf>, part: &str) -> Result<PathBuf, FetchError> {
    let missing = |reason: String| {
        FetchError::unexpected(
            Op::Fetch,
            ToolError {
                command: "go mod download".into(),
                message: reason,
            },
        )
    };

    let file = file.ok_or_else(|| missing(format!("no {part} file reported")))?;
    match tokio::fs::metadata(&file).await {
        Ok(metadata) if metadata.len() > 0 => Ok(file),
        Ok(_) => Err(missing(format!("{} is empty", file.display()))),
        Err(error) => Err(missing(format!("{}: {error}", file.display()))),
    }
}

/// Classify a toolchain failure by its message.
pub(crate) fn classify(
    command: &str,
    path: &PackagePath,
    version: &str,
    message: String,
) -> FetchError {
    let lower = message.to_lowercase();

    if lower.contains("403 response from api.github.com") || lower.contains("429") {
        return FetchError::RateLimited(message);
    }

    let not_found = ["not found", "404", "unknown revision", "invalid version"];
    if not_found.iter().any(|needle| lower.contains(needle)) {
        return FetchError::not_found(path, version, message);
    }

    FetchError::unexpected(
        Op::Fetch,
        ToolError {
            command: command.into(),
            message,
        },
    )
}

#[async_trait::async_trait]
impl Fetcher for Tool {
    async fn fetch(&self, path: &PackagePath, version: &str) -> Result<Staged, FetchError> {
        let workspace = Workspace::new()?;
        self.fetch_in(workspace, path, version).await
    }

    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, FetchError> {
        version::validate(version)?;
        if version::is_canonical(version) {
            return Ok(version.to_string());
        }

        let workspace = Workspace::new()?;
        self.resolve_in(&workspace, path, version).await
    }
}

#[async_trait::async_trait]
impl Lister for Tool {
    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, FetchError> {
        let workspace = Workspace::new()?;
        let target = path.to_string();
        let (module, failure): (Module, _) = self
            .run_json(&workspace, &["list", "-m", "-versions", "-json", &target])
            .await?;

        if let Some(message) = module.error.map(|error| error.err).or(failure) {
            return Err(classify("go list", path, "", message));
        }

        Ok(module.versions)
    }

    async fn latest(&self, path: &PackagePath) -> Result<VersionInfo, FetchError> {
        let workspace = Workspace::new()?;
        self.query(&workspace, path, "latest").await
    }
}
