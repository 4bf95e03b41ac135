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

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Response, StatusCode};
use url::Url;

use super::{FetchError, Fetcher, Lister, Staged, check_resolved};
use crate::{
    errors::Op,
    package::{Artifacts, PackagePath, VersionInfo, version},
};

/// Non-success response from the mirror.
#[derive(thiserror::Error, Debug)]
#[error("{url} responded with {status}")]
struct MirrorError {
    url: String,
    status: StatusCode,
}

/// Fetcher pulling from another proxy.
///
/// The three parts of a version are requested concurrently under one shared deadline. Either
/// all of them arrive, or the fetch fails and whatever did arrive is dropped.
#[derive(Clone, Debug)]
pub struct Mirror {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl Mirror {
    /// Create a fetcher for the mirror at `base`.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))?;

        Ok(Self::with_client(client, base, timeout))
    }

    /// Create a fetcher using an existing client.
    pub fn with_client(client: reqwest::Client, base: Url, timeout: Duration) -> Self {
        Self {
            client,
            base,
            timeout,
        }
    }

    /// Location of a resource of a package on the mirror.
    fn url(&self, path: &PackagePath, resource: &str) -> String {
        format!(
            "{}/{}/{resource}",
            self.base.as_str().trim_end_matches('/'),
            path.escaped()
        )
    }

    /// Location of one part of a version.
    fn part_url(&self, path: &PackagePath, version: &str, extension: &str) -> String {
        let version = PackagePath::escape(version);
        self.url(path, &format!("@v/{version}.{extension}"))
    }

    async fn request(
        &self,
        op: Op,
        path: &PackagePath,
        version: &str,
        url: String,
    ) -> Result<Response, FetchError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| FetchError::unexpected(op, error))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(FetchError::not_found(path, version, format!("{url} not found")))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited(url)),
            status => Err(FetchError::unexpected(op, MirrorError { url, status })),
        }
    }

    async fn download(
        &self,
        path: &PackagePath,
        version: &str,
        extension: &str,
    ) -> Result<Bytes, FetchError> {
        let url = self.part_url(path, version, extension);
        self.request(Op::Fetch, path, version, url)
            .await?
            .bytes()
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))
    }

    async fn info(
        &self,
        op: Op,
        path: &PackagePath,
        query: &str,
        url: String,
    ) -> Result<VersionInfo, FetchError> {
        let body = self
            .request(op, path, query, url)
            .await?
            .bytes()
            .await
            .map_err(|error| FetchError::unexpected(op, error))?;
        serde_json::from_slice(&body).map_err(|error| FetchError::unexpected(op, error))
    }

    /// Resolve a version query through the mirror's info resource.
    async fn lookup(&self, path: &PackagePath, version: &str) -> Result<String, FetchError> {
        version::validate(version)?;

        if version::is_canonical(version) {
            return Ok(version.to_string());
        }

        let url = self.part_url(path, version, Artifacts::INFO_EXTENSION);
        let info = self.info(Op::Resolve, path, version, url).await?;
        check_resolved(path, version, info)
    }
}

#[async_trait::async_trait]
impl Fetcher for Mirror {
    async fn fetch(&self, path: &PackagePath, version: &str) -> Result<Staged, FetchError> {
        version::validate(version)?;

        let download = async {
            let version = self.lookup(path, version).await?;

            let (info, manifest, archive) = tokio::try_join!(
                self.download(path, &version, Artifacts::INFO_EXTENSION),
                self.download(path, &version, Artifacts::MANIFEST_EXTENSION),
                self.download(path, &version, Artifacts::ARCHIVE_EXTENSION),
            )?;

            Ok::<_, FetchError>((
                version,
                Artifacts {
                    info,
                    manifest,
                    archive,
                },
            ))
        };

        let (version, artifacts) = tokio::time::timeout(self.timeout, download)
            .await
            .map_err(|error| FetchError::unexpected(Op::Fetch, error))??;

        tracing::debug!("retrieved {path}@{version} from {}", self.base);
        Ok(Staged::memory(path, &version, artifacts))
    }

    async fn resolve(&self, path: &PackagePath, version: &str) -> Result<String, FetchError> {
        tokio::time::timeout(self.timeout, self.lookup(path, version))
            .await
            .map_err(|error| FetchError::unexpected(Op::Resolve, error))?
    }
}

#[async_trait::async_trait]
impl Lister for Mirror {
    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, FetchError> {
        let url = self.url(path, "@v/list");
        let body = self
            .request(Op::UpstreamList, path, "", url)
            .await?
            .text()
            .await
            .map_err(|error| FetchError::unexpected(Op::UpstreamList, error))?;

        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn latest(&self, path: &PackagePath) -> Result<VersionInfo, FetchError> {
        let url = self.url(path, "@latest");
        self.info(Op::UpstreamLatest, path, "latest", url).await
    }
}
