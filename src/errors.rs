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

//! Error classification shared by every stage of the pipeline.

use std::sync::Arc;

/// Generic, shared error type.
///
/// As the underlying error type used by an adapter is not known, this error type is used to
/// carry it around. Using an [`Arc`] here allows the error to be cloned and cached, while
/// retaining as much information as possible.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Wrap any error into a [`SharedError`].
pub(crate) fn shared<E: std::error::Error + Send + Sync + 'static>(error: E) -> SharedError {
    Arc::new(error)
}

/// Classification of a failure.
///
/// The core only ever returns typed errors; the protocol layer sitting in front of it uses the
/// kind to decide on a transport level response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    /// Package path or version does not exist upstream or in storage.
    NotFound,
    /// Benign outcome of a concurrent save race.
    AlreadyExists,
    /// Upstream quota exhausted, retry after a backoff.
    RateLimited,
    /// Malformed package path or version string.
    BadRequest,
    /// The operation is not supported by this backend.
    NotImplemented,
    /// Any transport, tool or storage failure.
    Unexpected,
}

impl Kind {
    /// HTTP status code conventionally associated with this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::RateLimited => 429,
            Self::BadRequest => 400,
            Self::NotImplemented => 501,
            Self::Unexpected => 500,
        }
    }

    /// Determine if an operation failing with this kind may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unexpected)
    }
}

/// Stage of the pipeline an error originated in.
///
/// Errors crossing a stage boundary are tagged with the operation that failed so that a
/// single log line is enough to locate the failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Op {
    /// Checking storage for an existing copy.
    #[strum(serialize = "storage.exists")]
    Exists,
    /// Reading a stored triple.
    #[strum(serialize = "storage.get")]
    Get,
    /// Persisting a triple.
    #[strum(serialize = "storage.save")]
    Save,
    /// Listing stored versions.
    #[strum(serialize = "storage.list")]
    List,
    /// Retrieving artifacts from upstream.
    #[strum(serialize = "fetch")]
    Fetch,
    /// Resolving a version query to its canonical version.
    #[strum(serialize = "fetch.resolve")]
    Resolve,
    /// Reading staged artifacts.
    #[strum(serialize = "fetch.read")]
    Read,
    /// Listing upstream versions.
    #[strum(serialize = "upstream.list")]
    UpstreamList,
    /// Resolving the latest upstream version.
    #[strum(serialize = "upstream.latest")]
    UpstreamLatest,
}

#[test]
fn kinds_map_to_status_codes() {
    assert_eq!(Kind::NotFound.status_code(), 404);
    assert_eq!(Kind::RateLimited.status_code(), 429);
    assert_eq!(Kind::NotFound.to_string(), "not_found");
    assert!(Kind::RateLimited.is_retryable());
    assert!(!Kind::BadRequest.is_retryable());
    assert_eq!(Op::Save.to_string(), "storage.save");
}
