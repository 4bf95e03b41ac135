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

use std::{fmt, ops::Deref, str::FromStr};

use miette::IntoDiagnostic;
use serde::{Deserialize, Serialize};

/// A package path for parsing and type safety.
///
/// Package paths are slash-delimited and case-sensitive, for example
/// `github.com/Azure/azure-sdk-for-go`. Because many storage media are case-insensitive, a path
/// is never used verbatim as a storage key; use [`PackagePath::escaped`] instead.
#[derive(Clone, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[serde(try_from = "String", into = "String")]
pub struct PackagePath(String);

/// Errors that can be generated parsing [`PackagePath`], see [`PackagePath::new()`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PackagePathError {
    /// Empty package path.
    #[error("package path must not be empty")]
    Empty,
    /// Too long.
    #[error("package paths must be at most 512 characters long, but was {0:}")]
    TooLong(usize),
    /// Empty, `.` or `..` element.
    #[error("package path contains an invalid element at position {0:}")]
    InvalidElement(usize),
    /// Invalid character.
    #[error("package path must consist of ASCII letters, digits, slashes and `-._~`, but contains {0:?} at position {1:}")]
    InvalidCharacter(char, usize),
    /// Invalid escape sequence in an escaped path.
    #[error("escaped package path contains an invalid escape sequence at position {0:}")]
    InvalidEscape(usize),
}

impl PackagePath {
    const MAX_LENGTH: usize = 512;

    /// Marker prefixed to escaped uppercase letters.
    const ESCAPE: char = '!';

    /// New package path from string.
    pub fn new<S: Into<String>>(value: S) -> Result<Self, PackagePathError> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    /// Determine if this character is allowed anywhere in a package path.
    fn is_allowed(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/')
    }

    /// Validate a package path.
    pub fn validate(path: &str) -> Result<(), PackagePathError> {
        if path.is_empty() {
            return Err(PackagePathError::Empty);
        }

        if path.len() > Self::MAX_LENGTH {
            return Err(PackagePathError::TooLong(path.len()));
        }

        if let Some((index, c)) = path.chars().enumerate().find(|(_, c)| !Self::is_allowed(*c)) {
            return Err(PackagePathError::InvalidCharacter(c, index));
        }

        // leading, trailing and doubled slashes all show up as empty elements
        let invalid = path
            .split('/')
            .position(|element| matches!(element, "" | "." | ".."));
        if let Some(index) = invalid {
            return Err(PackagePathError::InvalidElement(index));
        }

        Ok(())
    }

    /// Escape this path for use as a storage key.
    ///
    /// Every uppercase letter is replaced by `!` followed by its lowercase form, which makes the
    /// key safe to use on case-insensitive media.
    pub fn escaped(&self) -> String {
        Self::escape(&self.0)
    }

    /// Escape any string the way package paths are escaped.
    ///
    /// Versions travel in the same URLs and keys as paths, and are escaped the same way.
    pub fn escape(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            if c.is_ascii_uppercase() {
                escaped.push(Self::ESCAPE);
                escaped.push(c.to_ascii_lowercase());
            } else {
                escaped.push(c);
            }
        }
        escaped
    }

    /// Reverse of [`PackagePath::escaped`].
    pub fn unescape(escaped: &str) -> Result<Self, PackagePathError> {
        let mut path = String::with_capacity(escaped.len());
        let mut chars = escaped.chars().enumerate();

        while let Some((index, c)) = chars.next() {
            match c {
                Self::ESCAPE => match chars.next() {
                    Some((_, next)) if next.is_ascii_lowercase() => {
                        path.push(next.to_ascii_uppercase())
                    }
                    _ => return Err(PackagePathError::InvalidEscape(index)),
                },
                c if c.is_ascii_uppercase() => return Err(PackagePathError::InvalidEscape(index)),
                c => path.push(c),
            }
        }

        Self::new(path)
    }

    /// The first element of the path, which names the host serving it.
    pub fn host(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl TryFrom<String> for PackagePath {
    type Error = PackagePathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for PackagePath {
    type Err = miette::Report;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::new(input).into_diagnostic()
    }
}

impl From<PackagePath> for String {
    fn from(s: PackagePath) -> Self {
        s.0
    }
}

impl Deref for PackagePath {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
