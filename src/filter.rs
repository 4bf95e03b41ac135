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

//! # Path filtering policy
//!
//! A [`Filter`] decides whether a package path may be processed at all, and whether it needs
//! to be fetched with restricted credentials. Rules are keyed by path prefix, and the most
//! specific matching rule wins.
//!
//! Rules can be loaded from a filter file, which holds one rule per line:
//!
//! ```text
//! # keep everything from the company host private
//! D git.example.com
//! - github.com/evil
//! + github.com/evil/but-useful
//! ```
//!
//! A line consisting of a sign only applies to the empty prefix, which matches every path.

use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

/// What to do with packages matching a rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Process normally.
    #[default]
    Include,
    /// Refuse to process.
    Exclude,
    /// Process, but only with an explicit credential binding.
    Private,
}

impl Disposition {
    /// Sign used for this disposition in filter files.
    pub fn sign(&self) -> char {
        match self {
            Self::Include => '+',
            Self::Exclude => '-',
            Self::Private => 'D',
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Include => write!(f, "include"),
            Self::Exclude => write!(f, "exclude"),
            Self::Private => write!(f, "private"),
        }
    }
}

/// Errors produced reading filter rules.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
pub enum FilterError {
    /// Line does not start with a known sign.
    #[error("line {line}: unknown rule {rule:?}, expected one of `+`, `-` or `D`")]
    UnknownRule {
        /// Line number, starting at one.
        line: usize,
        /// Offending rule.
        rule: String,
    },

    /// Filter file could not be read.
    #[error("failed to read filter file {path}")]
    Read {
        /// Location of the filter file.
        path: String,
        /// Underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// A single filter rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Path prefix this rule applies to.
    #[serde(default)]
    pub prefix: String,
    /// What to do with matching packages.
    pub disposition: Disposition,
}

/// Longest-prefix path filter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    rules: HashMap<String, Disposition>,
}

impl Filter {
    /// Create a filter without rules, which includes everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter from an ordered list of rules.
    ///
    /// Later rules replace earlier rules with the same prefix.
    pub fn from_rules<I: IntoIterator<Item = Rule>>(rules: I) -> Self {
        let mut filter = Self::new();
        for rule in rules {
            filter.add_rule(rule.prefix, rule.disposition);
        }
        filter
    }

    /// Add a rule, replacing any existing rule for the same prefix.
    pub fn add_rule<S: Into<String>>(&mut self, prefix: S, disposition: Disposition) {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_string();
        self.rules.insert(prefix, disposition);
    }

    /// Number of rules in this filter.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Determine if this filter has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve the disposition for a package path.
    ///
    /// Among all rules whose prefix is the path itself or one of its ancestors, the one with the
    /// longest prefix wins. Without any matching rule, the path is included.
    pub fn rule(&self, path: &str) -> Disposition {
        self.rules
            .iter()
            .filter(|(prefix, _)| is_ancestor(prefix, path))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, disposition)| *disposition)
            .unwrap_or_default()
    }

    /// Determine if a package path may be processed at all.
    pub fn should_process(&self, path: &str) -> bool {
        self.rule(path) != Disposition::Exclude
    }

    /// Parse rules in the filter file format.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let mut filter = Self::new();

        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (sign, prefix) = match line.split_once(char::is_whitespace) {
                Some((sign, prefix)) => (sign, prefix.trim()),
                None => (line, ""),
            };

            let disposition = match sign {
                "+" => Disposition::Include,
                "-" => Disposition::Exclude,
                "D" => Disposition::Private,
                _ => {
                    return Err(FilterError::UnknownRule {
                        line: index + 1,
                        rule: line.to_string(),
                    });
                }
            };

            filter.add_rule(prefix, disposition);
        }

        Ok(filter)
    }

    /// Read rules from a filter file.
    pub async fn load(path: &Path) -> Result<Self, FilterError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| FilterError::Read {
                path: path.display().to_string(),
                error,
            })?;

        let filter = Self::parse(&contents)?;
        tracing::debug!("loaded {} filter rules from {}", filter.len(), path.display());
        Ok(filter)
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

/// Determine if `prefix` names `path` itself or one of its ancestors.
fn is_ancestor(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn longest_prefix_excludes_descendants() {
        let mut filter = Filter::new();
        filter.add_rule("a/b", Disposition::Exclude);

        assert!(filter.should_process("a"));
        assert!(!filter.should_process("a/b"));
        assert!(!filter.should_process("a/b/c"));
        assert!(filter.should_process("d"));
        assert!(filter.should_process("a/bc"));
    }

    #[test]
    fn more_specific_rule_overrides_ancestor() {
        let mut filter = Filter::new();
        filter.add_rule("github.com/a/b", Disposition::Exclude);
        filter.add_rule("github.com/a/b/c", Disposition::Include);

        assert!(filter.should_process("github.com/a"));
        assert!(!filter.should_process("github.com/a/b"));
        assert!(filter.should_process("github.com/a/b/c"));
        assert!(filter.should_process("github.com/d"));
        assert!(filter.should_process("bitbucket.com/a/b"));
    }

    #[test]
    fn empty_prefix_is_catch_all() {
        let mut filter = Filter::new();
        filter.add_rule("github.com/a/b", Disposition::Include);
        filter.add_rule("", Disposition::Exclude);

        assert!(!filter.should_process("github.com/a"));
        assert!(filter.should_process("github.com/a/b"));
        assert!(filter.should_process("github.com/a/b/c"));
        assert!(!filter.should_process("github.com/d"));
        assert!(!filter.should_process("bitbucket.com/a/b"));
    }

    #[test]
    fn private_does_not_block() {
        let mut filter = Filter::new();
        filter.add_rule("github.com/a/b/c", Disposition::Exclude);
        filter.add_rule("github.com/a/b", Disposition::Private);
        filter.add_rule("github.com/a", Disposition::Include);
        filter.add_rule("", Disposition::Exclude);

        assert!(filter.should_process("github.com/a"));
        assert!(filter.should_process("github.com/a/b"));
        assert_eq!(filter.rule("github.com/a"), Disposition::Include);
        assert_eq!(filter.rule("github.com/a/b"), Disposition::Private);
        assert_eq!(filter.rule("github.com/a/b/c/d"), Disposition::Exclude);
        assert_eq!(filter.rule("gitlab.com"), Disposition::Exclude);
    }

    #[test]
    fn no_rules_includes_everything() {
        let filter = Filter::new();
        assert_eq!(filter.rule("github.com/a"), Disposition::Include);
    }

    #[test]
    fn readding_prefix_replaces_rule() {
        let mut filter = Filter::new();
        filter.add_rule("a/b", Disposition::Exclude);
        filter.add_rule("a/b", Disposition::Include);
        assert_eq!(filter.len(), 1);
        assert!(filter.should_process("a/b"));
    }

    #[test]
    fn parses_filter_file() {
        let filter = Filter::parse(
            "# comment\n\
             D git.example.com\n\
             - github.com/a/b\n\
             \n\
             + github.com/a/b/c\n\
             -\n",
        )
        .unwrap();

        assert_eq!(filter.len(), 4);
        assert_eq!(filter.rule("git.example.com/x"), Disposition::Private);
        assert_eq!(filter.rule("github.com/a/b"), Disposition::Exclude);
        assert_eq!(filter.rule("github.com/a/b/c"), Disposition::Include);
        assert_eq!(filter.rule("golang.org/x/net"), Disposition::Exclude);
    }

    #[test]
    fn rejects_unknown_rules() {
        let error = Filter::parse("+ github.com/a\n? github.com/b\n").unwrap_err();
        assert!(matches!(error, FilterError::UnknownRule { line: 2, .. }));
    }

    #[test]
    fn from_rules_keeps_last_duplicate() {
        let filter = Filter::from_rules([
            Rule {
                prefix: "a".into(),
                disposition: Disposition::Exclude,
            },
            Rule {
                prefix: "a".into(),
                disposition: Disposition::Private,
            },
        ]);
        assert_eq!(filter.rule("a/b"), Disposition::Private);
    }
}
