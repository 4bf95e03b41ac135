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

//! Version strings and pseudo-versions.
//!
//! A canonical version is a semantic version prefixed with `v`, e.g. `v1.4.2`. Anything else a
//! client asks for (a branch, a tag that is not a semantic version, a commit hash) is a revision
//! query, and has to be resolved to a pseudo-version before it can be stored.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors produced validating a version string for use as a storage key.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum VersionError {
    /// Empty version.
    #[error("version must not be empty")]
    Empty,
    /// Version that would escape its storage location.
    #[error("version {0:?} is not allowed")]
    Reserved(String),
    /// Invalid character.
    #[error("version must not contain {0:?}, but contains it at position {1:}")]
    InvalidCharacter(char, usize),
}

/// Validate that a version string can safely be used as part of a storage key.
pub fn validate(version: &str) -> Result<(), VersionError> {
    if version.is_empty() {
        return Err(VersionError::Empty);
    }

    if matches!(version, "." | "..") {
        return Err(VersionError::Reserved(version.into()));
    }

    let illegal = version
        .chars()
        .enumerate()
        .find(|(_, c)| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\'));
    if let Some((index, c)) = illegal {
        return Err(VersionError::InvalidCharacter(c, index));
    }

    Ok(())
}

/// Parse a canonical version into its semantic version.
pub fn parse(version: &str) -> Option<semver::Version> {
    version
        .strip_prefix('v')
        .and_then(|version| semver::Version::parse(version).ok())
}

/// Determine if a version is canonical, as opposed to a revision query.
pub fn is_canonical(version: &str) -> bool {
    parse(version).is_some()
}

/// Determine if a canonical version is a pseudo-version.
pub fn is_pseudo(version: &str) -> bool {
    Revision::from_pseudo_version(version).is_some()
}

/// Compare two versions by semantic version precedence.
///
/// Versions which are not canonical sort before every canonical version, and among themselves
/// lexicographically.
pub fn compare(left: &str, right: &str) -> Ordering {
    match (parse(left), parse(right)) {
        (Some(l), Some(r)) => l.cmp_precedence(&r).then_with(|| left.cmp(right)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => left.cmp(right),
    }
}

/// Metadata of a single revision, as reported by the version control system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    /// Commit time of the revision.
    pub time: DateTime<Utc>,
    /// Full or abbreviated revision identifier.
    pub id: String,
    /// Most recent canonical version that is an ancestor of this revision, if any.
    pub base: Option<semver::Version>,
}

impl Revision {
    /// Length of the abbreviated revision identifier in a pseudo-version.
    pub const SHORT_LENGTH: usize = 12;

    /// Format of the timestamp in a pseudo-version.
    const TIMESTAMP_FORMAT: &'static str = "%Y%m%d%H%M%S";

    /// Abbreviated revision identifier.
    pub fn short_id(&self) -> String {
        self.id
            .chars()
            .take(Self::SHORT_LENGTH)
            .collect::<String>()
            .to_ascii_lowercase()
    }

    /// Recover the revision a pseudo-version names.
    ///
    /// Returns `None` unless `version` is exactly the pseudo-version [`Revision::pseudo_version`]
    /// derives for the recovered revision.
    pub fn from_pseudo_version(version: &str) -> Option<Self> {
        let parsed = parse(version)?;
        let pre = parsed.pre.as_str();

        // the last pre-release identifier is `<timestamp>-<revision>`
        let (rest, stamp) = match pre.rsplit_once('.') {
            Some((rest, stamp)) => (Some(rest), stamp),
            None => (None, pre),
        };
        let (timestamp, id) = stamp.split_once('-')?;

        let lowercase_hex = |b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b);
        if timestamp.len() != 14
            || id.len() != Self::SHORT_LENGTH
            || !id.bytes().all(lowercase_hex)
        {
            return None;
        }
        let time = NaiveDateTime::parse_from_str(timestamp, Self::TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();

        let base = match rest {
            None => None,
            Some("0") => Some(semver::Version {
                patch: parsed.patch.checked_sub(1)?,
                pre: semver::Prerelease::EMPTY,
                ..parsed.clone()
            }),
            Some(rest) => Some(semver::Version {
                pre: semver::Prerelease::new(rest.strip_suffix(".0")?).ok()?,
                ..parsed.clone()
            }),
        };

        let revision = Self {
            time,
            id: id.into(),
            base,
        };
        (revision.pseudo_version() == version).then_some(revision)
    }

    /// Derive the pseudo-version naming this revision.
    ///
    /// This is deterministic: the same revision metadata always produces the same string.
    pub fn pseudo_version(&self) -> String {
        let stamp = format!(
            "{}-{}",
            self.time.format(Self::TIMESTAMP_FORMAT),
            self.short_id()
        );

        let Some(base) = &self.base else {
            return format!("v0.0.0-{stamp}");
        };

        let build = if base.build.is_empty() {
            String::new()
        } else {
            format!("+{}", base.build)
        };

        if base.pre.is_empty() {
            format!(
                "v{}.{}.{}-0.{stamp}{build}",
                base.major,
                base.minor,
                base.patch + 1
            )
        } else {
            format!(
                "v{}.{}.{}-{}.0.{stamp}{build}",
                base.major, base.minor, base.patch, base.pre
            )
        }
    }
}

/// Version metadata, as served for `<version>.info` and `@latest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    /// Canonical version.
    pub version: String,
    /// Commit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}
