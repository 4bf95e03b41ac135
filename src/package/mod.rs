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

mod path;
pub mod version;

use std::io::Cursor;

use bytes::Bytes;

pub use self::{
    path::{PackagePath, PackagePathError},
    version::{Revision, VersionInfo},
};

/// The three parts that together make up one stored package version.
///
/// The contents are opaque: they are moved and persisted as a unit, never parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifacts {
    /// Version metadata (`<version>.info`).
    pub info: Bytes,
    /// Dependency declarations (`<version>.mod`).
    pub manifest: Bytes,
    /// Source tree archive (`<version>.zip`).
    pub archive: Bytes,
}

impl Artifacts {
    /// File extension of the info part.
    pub const INFO_EXTENSION: &'static str = "info";
    /// File extension of the manifest part.
    pub const MANIFEST_EXTENSION: &'static str = "mod";
    /// File extension of the archive part.
    pub const ARCHIVE_EXTENSION: &'static str = "zip";

    /// Stream over the archive bytes.
    pub fn archive_reader(&self) -> Cursor<Bytes> {
        Cursor::new(self.archive.clone())
    }

    /// Total size of all three parts, in bytes.
    pub fn len(&self) -> usize {
        self.info.len() + self.manifest.len() + self.archive.len()
    }

    /// Determine if all three parts are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
