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

use aws_sdk_s3::{Client, error::ProvideErrorMetadata, primitives::ByteStream};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    errors::shared,
    package::{Artifacts, PackagePath},
    storage::{CatalogPage, Storage, StorageError, check_version},
};

/// Separator between package path and versions in object keys.
const VERSIONS_SEPARATOR: &str = "/@v/";

/// S3-backend storage.
///
/// Each part is its own object, `<escaped path>/@v/<version>.<extension>`. The info object is
/// written last and serves as the commit marker: a version without it is not considered stored.
#[derive(Clone, Debug)]
pub struct S3 {
    client: Client,
    bucket: String,
}

impl S3 {
    /// Create new S3 storage using the given client and bucket.
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    fn key(path: &PackagePath, version: &str, extension: &str) -> String {
        format!(
            "{}{VERSIONS_SEPARATOR}{version}.{extension}",
            path.escaped()
        )
    }

    /// Write an object. A conditional write fails with `Ok(false)` if the object exists.
    async fn put(&self, key: &str, data: Bytes, conditional: bool) -> Result<bool, StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));
        if conditional {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(error) if error.as_service_error().is_some_and(is_conflict) => Ok(false),
            Err(error) => Err(shared(error).into()),
        }
    }

    /// Write one part of an uncommitted version.
    ///
    /// Leftovers of an unfinished save are replaced, parts of a committed version never are.
    async fn put_part(
        &self,
        path: &PackagePath,
        version: &str,
        key: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        if self.put(key, data.clone(), true).await? {
            return Ok(());
        }
        if self.exists(path, version).await {
            return Err(StorageError::already_exists(path, version));
        }

        tracing::debug!("replacing leftover object {key}");
        self.put(key, data, false).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        path: &PackagePath,
        version: &str,
        extension: &str,
    ) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::key(path, version, extension))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|error| error.is_no_such_key()) =>
            {
                return Err(StorageError::missing(path, version));
            }
            Err(error) => return Err(shared(error).into()),
        };

        let data = response.body.collect().await.map_err(shared)?;
        Ok(data.into_bytes())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(shared)?;
        Ok(())
    }

    /// Parse an info object key back into a package version.
    fn parse_key(key: &str) -> Option<(PackagePath, String)> {
        let (escaped, file) = key.split_once(VERSIONS_SEPARATOR)?;
        let version = file.strip_suffix(&format!(".{}", Artifacts::INFO_EXTENSION))?;
        let path = PackagePath::unescape(escaped).ok()?;
        Some((path, version.to_string()))
    }
}

#[async_trait::async_trait]
impl Storage for S3 {
    async fn exists(&self, path: &PackagePath, version: &str) -> bool {
        if check_version(version).is_err() {
            return false;
        }

        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(Self::key(path, version, Artifacts::INFO_EXTENSION))
            .send()
            .await
            .is_ok()
    }

    async fn get(&self, path: &PackagePath, version: &str) -> Result<Artifacts, StorageError> {
        check_version(version)?;

        // the info object is checked first, so parts of an unfinished save are never served.
        let info = self
            .fetch(path, version, Artifacts::INFO_EXTENSION)
            .await?;
        let (manifest, archive) = tokio::try_join!(
            self.fetch(path, version, Artifacts::MANIFEST_EXTENSION),
            self.fetch(path, version, Artifacts::ARCHIVE_EXTENSION),
        )?;

        Ok(Artifacts {
            info,
            manifest,
            archive,
        })
    }

    async fn save(
        &self,
        path: &PackagePath,
        version: &str,
        manifest: &[u8],
        archive: &mut (dyn AsyncRead + Send + Unpin),
        info: &[u8],
    ) -> Result<(), StorageError> {
        check_version(version)?;

        if self.exists(path, version).await {
            return Err(StorageError::already_exists(path, version));
        }

        let mut data = Vec::new();
        archive.read_to_end(&mut data).await.map_err(shared)?;

        let parts = [
            (Artifacts::MANIFEST_EXTENSION, Bytes::copy_from_slice(manifest)),
            (Artifacts::ARCHIVE_EXTENSION, Bytes::from(data)),
        ];

        let mut written: Vec<String> = vec![];
        let mut result = Ok(());
        for (extension, data) in parts {
            let key = Self::key(path, version, extension);
            result = self.put_part(path, version, &key, data).await;
            if result.is_err() {
                break;
            }
            written.push(key);
        }

        // the info object is the commit marker and is only ever written once.
        if result.is_ok() {
            let key = Self::key(path, version, Artifacts::INFO_EXTENSION);
            result = match self.put(&key, Bytes::copy_from_slice(info), true).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(StorageError::already_exists(path, version)),
                Err(error) => Err(error),
            };
        }

        match result {
            Ok(()) => Ok(()),
            Err(error @ StorageError::AlreadyExists { .. }) => Err(error),
            Err(error) => {
                // once a concurrent save committed, the parts are its own.
                if !self.exists(path, version).await {
                    for key in &written {
                        if let Err(error) = self.remove(key).await {
                            tracing::warn!("failed to remove partial object {key}: {error}");
                        }
                    }
                }
                Err(error)
            }
        }
    }

    async fn list(&self, path: &PackagePath) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}{VERSIONS_SEPARATOR}", path.escaped());
        let mut versions = vec![];
        let mut token = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(shared)?;

            versions.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(Self::parse_key)
                    .filter(|(found, _)| found == path)
                    .map(|(_, version)| version),
            );

            match response.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        Ok(versions)
    }

    async fn delete(&self, path: &PackagePath, version: &str) -> Result<(), StorageError> {
        check_version(version)?;

        if !self.exists(path, version).await {
            return Err(StorageError::missing(path, version));
        }

        // removing the info object first hides the version from readers.
        for extension in [
            Artifacts::INFO_EXTENSION,
            Artifacts::MANIFEST_EXTENSION,
            Artifacts::ARCHIVE_EXTENSION,
        ] {
            self.remove(&Self::key(path, version, extension)).await?;
        }

        Ok(())
    }

    async fn catalog(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<CatalogPage, StorageError> {
        // each version has three objects, of which only the info object is reported.
        let max_keys = i32::try_from(page_size.saturating_mul(3)).unwrap_or(i32::MAX);
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(max_keys.max(3))
            .set_continuation_token(token.map(String::from))
            .send()
            .await
            .map_err(shared)?;

        let entries = response
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter_map(Self::parse_key)
            .collect();

        Ok(CatalogPage {
            entries,
            next: response.next_continuation_token().map(String::from),
        })
    }
}

/// Determine if a conditional write lost against another writer.
fn is_conflict(error: &impl ProvideErrorMetadata) -> bool {
    matches!(
        error.code(),
        Some("PreconditionFailed" | "ConditionalRequestConflict")
    )
}
