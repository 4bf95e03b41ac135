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

#![doc = include_str!("../README.md")]

/// Configuration file format
pub mod config;
/// Components wired together from a configuration
pub mod context;
/// Error classification
pub mod errors;
/// Retrieving package versions from upstream
pub mod fetch;
/// Path filter
pub mod filter;
/// Per-version mutual exclusion
pub mod lock;
/// Package paths, versions and artifacts
pub mod package;
/// Proxy entry points
pub mod protocol;
/// Single-flight stashing into storage
pub mod stash;
/// Storage backends
pub mod storage;
